//! Linux USBTMC character-device transport (`/dev/usbtmcN`).
//!
//! One read/write handle is kept open across commands. Writes are retried on a
//! fresh handle; a failing read discards the handle so the next operation
//! starts clean. On every (re)open the kernel driver is tuned through sysfs
//! where the attributes exist: I/O timeout and newline termination.

use super::{decode_response, frame_command, Transport, TransportError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Default I/O timeout.
pub const DEFAULT_USBTMC_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between the write and read halves of a query.
pub const DEFAULT_INTER_QUERY_DELAY: Duration = Duration::from_millis(20);

/// Where the kernel exposes per-device usbtmc attributes.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/usbtmc";

const WRITE_ATTEMPTS: usize = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);
const READ_ATTEMPTS: usize = 3;
const READ_BACKOFF: Duration = Duration::from_millis(20);
const READ_BUFFER: usize = 65536;

/// Extra time granted to a blocking device read beyond the kernel timeout.
const READ_GRACE: Duration = Duration::from_millis(500);

/// Transport over a USBTMC device node.
pub struct UsbTmcTransport {
    path: PathBuf,
    timeout: Duration,
    inter_query_delay: Duration,
    sysfs_root: PathBuf,
    file: Option<File>,
}

impl UsbTmcTransport {
    /// Create a transport for `path`. The device is opened on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_USBTMC_TIMEOUT,
            inter_query_delay: DEFAULT_INTER_QUERY_DELAY,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            file: None,
        }
    }

    /// Set the I/O timeout (pushed to the kernel driver on open).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between the write and read halves of a query.
    pub fn with_inter_query_delay(mut self, delay: Duration) -> Self {
        self.inter_query_delay = delay;
        self
    }

    /// Override the sysfs class directory.
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a handle is currently open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn handle(&mut self) -> Result<&mut File, TransportError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                tune_driver(&self.sysfs_root, &self.path, self.timeout).await;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.path)
                    .await
                    .map_err(|source| TransportError::Connect {
                        endpoint: self.path.display().to_string(),
                        source,
                    })?;
                debug!(path = %self.path.display(), "USBTMC device opened");
                file
            }
        };
        Ok(self.file.insert(file))
    }

    fn discard(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "USBTMC handle discarded");
        }
    }

    async fn try_write(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let file = self.handle().await?;
        file.write_all(payload).await?;
        file.flush().await?;
        Ok(())
    }

    async fn try_read(&mut self) -> Result<Vec<u8>, TransportError> {
        let limit = self.timeout + READ_GRACE;
        let file = self.handle().await?;
        let mut buf = vec![0u8; READ_BUFFER];
        match tokio::time::timeout(limit, file.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }
}

/// Best-effort kernel driver tuning. Missing attributes are skipped and write
/// failures are only traced; an untuned device still works with defaults.
async fn tune_driver(sysfs_root: &Path, device: &Path, timeout: Duration) {
    let Some(base) = device.file_name() else {
        return;
    };
    let dir = sysfs_root.join(base);
    let attributes = [
        ("io_timeout", timeout.as_millis().to_string()),
        ("term_char", "10".to_string()),
        ("term_char_enabled", "1".to_string()),
    ];

    for (name, value) in attributes {
        let attr = dir.join(name);
        if !tokio::fs::try_exists(&attr).await.unwrap_or(false) {
            continue;
        }
        if let Err(e) = tokio::fs::write(&attr, value.as_bytes()).await {
            trace!(attr = %attr.display(), error = %e, "sysfs tuning skipped");
        }
    }
}

#[async_trait]
impl Transport for UsbTmcTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let payload = frame_command(command);
        let mut last_err = None;

        for attempt in 1..=WRITE_ATTEMPTS {
            match self.try_write(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "USBTMC write failed"
                    );
                    self.discard();
                    last_err = Some(e);
                    if attempt < WRITE_ATTEMPTS {
                        tokio::time::sleep(WRITE_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| TransportError::NotConnected(self.path.display().to_string())))
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        let mut last_err = None;

        for attempt in 1..=READ_ATTEMPTS {
            match self.try_read().await {
                Ok(data) if !data.is_empty() => return Ok(decode_response(&data)),
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        path = %self.path.display(),
                        error = %e,
                        "USBTMC read failed, resetting handle"
                    );
                    self.discard();
                    last_err = Some(e);
                }
            }
            if attempt < READ_ATTEMPTS {
                tokio::time::sleep(READ_BACKOFF).await;
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(String::new()),
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command).await?;
        if !self.inter_query_delay.is_zero() {
            tokio::time::sleep(self.inter_query_delay).await;
        }
        self.read().await
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        // The kernel timeout is only pushed on open.
        self.discard();
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn remote(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }

    async fn close(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device_in(dir: &TempDir, contents: &[u8]) -> PathBuf {
        let path = dir.path().join("usbtmc0");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn read_returns_trimmed_response() {
        let dir = TempDir::new().unwrap();
        let path = device_in(&dir, b"Siglent Technologies,SDM3045X,SDM34AB,1.01\r\n");
        let mut transport = UsbTmcTransport::new(&path).with_sysfs_root(dir.path().join("sys"));

        let reply = transport.read().await.unwrap();
        assert_eq!(reply, "Siglent Technologies,SDM3045X,SDM34AB,1.01");
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn empty_reads_yield_empty_string_and_keep_handle() {
        let dir = TempDir::new().unwrap();
        let path = device_in(&dir, b"");
        let mut transport = UsbTmcTransport::new(&path).with_sysfs_root(dir.path().join("sys"));

        assert_eq!(transport.read().await.unwrap(), "");
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn write_appends_terminator() {
        let dir = TempDir::new().unwrap();
        let path = device_in(&dir, b"");
        let mut transport = UsbTmcTransport::new(&path).with_sysfs_root(dir.path().join("sys"));

        transport.write("CONF:VOLT:DC").await.unwrap();
        transport.close().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"CONF:VOLT:DC\n");
    }

    #[tokio::test]
    async fn missing_device_fails_after_retries() {
        let dir = TempDir::new().unwrap();
        let mut transport = UsbTmcTransport::new(dir.path().join("usbtmc9"))
            .with_sysfs_root(dir.path().join("sys"));

        let err = transport.write("*IDN?").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!transport.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_only_between_attempts() {
        let dir = TempDir::new().unwrap();
        let mut transport = UsbTmcTransport::new(dir.path().join("usbtmc9"))
            .with_sysfs_root(dir.path().join("sys"));

        let start = tokio::time::Instant::now();
        transport.write("*IDN?").await.unwrap_err();
        assert_eq!(start.elapsed(), WRITE_BACKOFF * (WRITE_ATTEMPTS as u32 - 1));

        let start = tokio::time::Instant::now();
        transport.read().await.unwrap_err();
        assert_eq!(start.elapsed(), READ_BACKOFF * (READ_ATTEMPTS as u32 - 1));
    }

    #[tokio::test]
    async fn tunes_existing_sysfs_attributes_only() {
        let dir = TempDir::new().unwrap();
        let path = device_in(&dir, b"1\n");
        let sys = dir.path().join("sys");
        let attrs = sys.join("usbtmc0");
        std::fs::create_dir_all(&attrs).unwrap();
        std::fs::write(attrs.join("io_timeout"), "5000").unwrap();
        std::fs::write(attrs.join("term_char_enabled"), "0").unwrap();

        let mut transport = UsbTmcTransport::new(&path)
            .with_timeout(Duration::from_millis(2500))
            .with_sysfs_root(&sys);
        assert_eq!(transport.read().await.unwrap(), "1");

        assert_eq!(std::fs::read_to_string(attrs.join("io_timeout")).unwrap(), "2500");
        assert_eq!(std::fs::read_to_string(attrs.join("term_char_enabled")).unwrap(), "1");
        assert!(!attrs.join("term_char").exists());
    }

    #[test]
    fn timeout_change_forces_reopen() {
        let mut transport = UsbTmcTransport::new("/dev/usbtmc0");
        transport.set_timeout(Duration::from_secs(10));
        assert_eq!(transport.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(transport.remote().as_deref(), Some("/dev/usbtmc0"));
    }
}
