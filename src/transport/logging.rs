//! Protocol logging decorator.
//!
//! [`LoggingTransport`] mirrors every command and response of the wrapped
//! transport into a [`ProtocolLog`]: newline-delimited JSON, one object per
//! event, appended and flushed as it happens so a crashed run still leaves a
//! replayable trace.
//!
//! ```text
//! {"ts":1718031234.51,"role":"psu","op":"open","remote":"192.168.1.50:5025","data":""}
//! {"ts":1718031234.52,"role":"psu","op":"write","remote":"192.168.1.50:5025","data":"MEAS:CURR? CH1"}
//! {"ts":1718031234.55,"role":"psu","op":"read","remote":"192.168.1.50:5025","data":"0.2513"}
//! ```
//!
//! Log failures never reach the caller. A full disk must not take down a run
//! that is otherwise protecting the hardware.

use super::{Transport, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Remote description used when the transport cannot describe its peer.
pub const UNKNOWN_REMOTE: &str = "unknown";

/// Event kind of a protocol record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolOp {
    /// Decorator attached to a transport.
    Open,
    /// Command sent to the instrument.
    Write,
    /// Response received from the instrument.
    Read,
}

/// One line of the protocol log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    /// Seconds since the Unix epoch.
    pub ts: f64,
    /// Instrument role (`psu`, `dmm`, `scope`, `ens210`).
    pub role: String,
    /// Event kind.
    pub op: ProtocolOp,
    /// `host:port`, device path, or [`UNKNOWN_REMOTE`].
    pub remote: String,
    /// Command or response text.
    pub data: String,
}

/// Shared append-only sink for protocol records.
///
/// Cloning is cheap and every clone appends to the same writer, so a single
/// log file can collect the traffic of every instrument in a run. Writes are
/// serialized by an internal mutex.
#[derive(Clone)]
pub struct ProtocolLog {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for ProtocolLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolLog").finish_non_exhaustive()
    }
}

impl ProtocolLog {
    /// Log into an arbitrary writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Open `path` in append mode, creating it if needed.
    pub fn append_to(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::new(file))
    }

    /// Append one record. Errors are discarded.
    pub fn record(&self, role: &str, op: ProtocolOp, remote: &str, data: &str) {
        let record = ProtocolRecord {
            ts: unix_seconds(),
            role: role.to_string(),
            op,
            remote: remote.to_string(),
            data: data.to_string(),
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');

        // A poisoned lock only means another writer panicked mid-line; the
        // underlying writer is still usable.
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if writer.write_all(line.as_bytes()).is_ok() {
            let _ = writer.flush();
        }
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Transport decorator that records all traffic to a [`ProtocolLog`].
///
/// Only `write`, `read` and `query` are intercepted; timeout changes, remote
/// description and `close` go straight to the inner transport. `query` is
/// forwarded as a `query` (not split into write + read) so transports whose
/// query semantics differ from a bare write/read pair, such as
/// [`super::OneShotTcpTransport`], keep working.
pub struct LoggingTransport<T: Transport> {
    inner: T,
    role: String,
    remote: String,
    log: ProtocolLog,
}

impl<T: Transport> LoggingTransport<T> {
    /// Wrap `inner` and record the `open` event.
    pub fn new(inner: T, role: impl Into<String>, log: ProtocolLog) -> Self {
        let role = role.into();
        let remote = inner.remote().unwrap_or_else(|| UNKNOWN_REMOTE.to_string());
        log.record(&role, ProtocolOp::Open, &remote, "");
        Self {
            inner,
            role,
            remote,
            log,
        }
    }

    /// Role written into every record.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Borrow the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Unwrap the decorator.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn log(&self, op: ProtocolOp, data: &str) {
        self.log.record(&self.role, op, &self.remote, data);
    }
}

#[async_trait]
impl<T: Transport> Transport for LoggingTransport<T> {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.log(ProtocolOp::Write, command);
        self.inner.write(command).await
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        let response = self.inner.read().await?;
        self.log(ProtocolOp::Read, &response);
        Ok(response)
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.log(ProtocolOp::Write, command);
        let response = self.inner.query(command).await?;
        self.log(ProtocolOp::Read, &response);
        Ok(response)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn remote(&self) -> Option<String> {
        self.inner.remote()
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}
