//! SCPI over raw TCP sockets.
//!
//! Two strategies are provided because bench instruments disagree about what
//! they tolerate:
//!
//! - [`PersistentTcpTransport`] keeps one session open for the whole run and
//!   transparently reconnects when the instrument (or a NAT box, or a
//!   half-open socket) drops it.
//! - [`OneShotTcpTransport`] opens a connection per command and always closes
//!   it afterwards. Some firmwares leak sessions, so connects are paced by a
//!   fixed backoff.

use super::{decode_response, frame_command, Transport, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default per-operation socket timeout.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Multiple of the timeout allowed for assembling one response line.
const READ_DEADLINE_FACTOR: f64 = 2.5;

/// Floor applied before the deadline factor so tiny timeouts still leave room
/// for a few partial reads.
const MIN_READ_BASIS: Duration = Duration::from_secs(1);

const RECV_CHUNK: usize = 4096;

/// How a response read ended.
#[derive(Debug)]
enum Received {
    /// Newline-terminated response.
    Line(Vec<u8>),
    /// Deadline passed with some bytes but no terminator.
    Partial(Vec<u8>),
    /// Peer closed the stream. May carry a trailing unterminated fragment.
    Eof(Vec<u8>),
}

fn read_deadline(timeout: Duration) -> Duration {
    timeout.max(MIN_READ_BASIS).mul_f64(READ_DEADLINE_FACTOR)
}

/// Accumulate bytes until a newline, EOF, or the overall deadline.
///
/// Each individual `read` is bounded by `timeout`; a read timeout before the
/// deadline is retried, since a slow instrument may be mid-message.
async fn recv_until_newline(
    stream: &mut TcpStream,
    timeout: Duration,
) -> Result<Received, TransportError> {
    let deadline = Instant::now() + read_deadline(timeout);
    let mut data = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK];

    loop {
        let now = Instant::now();
        if now >= deadline {
            if data.is_empty() {
                return Err(TransportError::Timeout(read_deadline(timeout)));
            }
            return Ok(Received::Partial(data));
        }

        let wait = timeout.min(deadline - now);
        match tokio::time::timeout(wait, stream.read(&mut chunk)).await {
            Err(_) => continue,
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Ok(Ok(0)) => return Ok(Received::Eof(data)),
            Ok(Ok(n)) => {
                data.extend_from_slice(&chunk[..n]);
                if data.ends_with(b"\n") {
                    return Ok(Received::Line(data));
                }
            }
        }
    }
}

async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let endpoint = format!("{host}:{port}");
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::Connect { endpoint, source }),
        Err(_) => {
            return Err(TransportError::Connect {
                endpoint,
                source: std::io::ErrorKind::TimedOut.into(),
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable Nagle on {}", endpoint);
    }
    Ok(stream)
}

async fn send_all(
    stream: &mut TcpStream,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    match tokio::time::timeout(timeout, stream.write_all(payload)).await {
        Ok(result) => result.map_err(TransportError::Io),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

// =============================================================================
// Persistent session
// =============================================================================

/// One long-lived TCP session per instrument.
///
/// The socket is opened lazily on first use and reused across calls. Any send
/// failure closes it, reconnects exactly once and resends; a second failure is
/// returned to the caller. A `query` whose answer never arrives because the
/// peer dropped the session gets the same single reconnect-and-retry.
pub struct PersistentTcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl PersistentTcpTransport {
    /// Create a transport for `host:port`. No connection is made yet.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TCP_TIMEOUT,
            stream: None,
        }
    }

    /// Set the socket timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port` of the instrument.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn session(&mut self) -> Result<&mut TcpStream, TransportError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = connect(&self.host, self.port, self.timeout).await?;
                debug!(endpoint = %self.endpoint(), "TCP session opened");
                stream
            }
        };
        Ok(self.stream.insert(stream))
    }

    fn drop_session(&mut self) {
        if self.stream.take().is_some() {
            debug!(endpoint = %self.endpoint(), "TCP session discarded");
        }
    }

    async fn try_send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let stream = self.session().await?;
        send_all(stream, payload, timeout).await
    }

    /// Send with one reconnect-and-resend on failure.
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        match self.try_send(payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(endpoint = %self.endpoint(), error = %first, "send failed, reconnecting");
                self.drop_session();
                self.try_send(payload).await
            }
        }
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        let timeout = self.timeout;
        let stream = self.session().await?;
        let received = recv_until_newline(stream, timeout).await;

        match received {
            Ok(Received::Line(data)) => Ok(decode_response(&data)),
            Ok(Received::Partial(data)) => {
                // Whatever is still in flight would be misread as the next
                // answer, so the session goes with it.
                warn!(
                    endpoint = %self.endpoint(),
                    bytes = data.len(),
                    "partial response at deadline"
                );
                self.drop_session();
                Ok(decode_response(&data))
            }
            Ok(Received::Eof(data)) => {
                self.drop_session();
                if data.is_empty() {
                    Err(TransportError::Closed(self.endpoint()))
                } else {
                    Ok(decode_response(&data))
                }
            }
            Err(e) => {
                self.drop_session();
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<String, TransportError> {
        self.try_send(payload).await?;
        self.receive().await
    }
}

#[async_trait]
impl Transport for PersistentTcpTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.send(&frame_command(command)).await
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        self.receive().await
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let payload = frame_command(command);
        match self.exchange(&payload).await {
            Ok(response) => Ok(response),
            Err(first) if first.is_connection_fault() => {
                warn!(
                    endpoint = %self.endpoint(),
                    error = %first,
                    command,
                    "query failed, reconnecting"
                );
                self.drop_session();
                self.exchange(&payload).await
            }
            Err(e) => Err(e),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn remote(&self) -> Option<String> {
        Some(self.endpoint())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

// =============================================================================
// One connection per command
// =============================================================================

/// Opens a fresh connection for every `write` and `query`.
///
/// The connection is always closed when the operation finishes, whether it
/// succeeded or not. Because no session outlives a command, a bare `read` has
/// nothing to read from and reports [`TransportError::NotConnected`].
pub struct OneShotTcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    connect_backoff: Duration,
}

impl OneShotTcpTransport {
    /// Create a transport for `host:port` with no connect pacing.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TCP_TIMEOUT,
            connect_backoff: Duration::ZERO,
        }
    }

    /// Set the socket timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sleep this long before every connect.
    pub fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    /// `host:port` of the instrument.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> Result<TcpStream, TransportError> {
        if !self.connect_backoff.is_zero() {
            tokio::time::sleep(self.connect_backoff).await;
        }
        connect(&self.host, self.port, self.timeout).await
    }

    /// Connect and send, retrying once on a fresh connection.
    async fn send_fresh(&self, payload: &[u8]) -> Result<TcpStream, TransportError> {
        let mut stream = self.open().await?;
        match send_all(&mut stream, payload, self.timeout).await {
            Ok(()) => Ok(stream),
            Err(first) => {
                debug!(
                    endpoint = %self.endpoint(),
                    error = %first,
                    "send failed, retrying on new connection"
                );
                drop(stream);
                let mut stream = self.open().await?;
                send_all(&mut stream, payload, self.timeout).await?;
                Ok(stream)
            }
        }
    }
}

#[async_trait]
impl Transport for OneShotTcpTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let mut stream = self.send_fresh(&frame_command(command)).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        Err(TransportError::NotConnected(format!(
            "{} is one-shot; responses are only read within query",
            self.endpoint()
        )))
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let mut stream = self.send_fresh(&frame_command(command)).await?;
        let received = recv_until_newline(&mut stream, self.timeout).await;
        let _ = stream.shutdown().await;
        drop(stream);

        match received? {
            Received::Line(data) | Received::Partial(data) | Received::Eof(data) => {
                Ok(decode_response(&data))
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn remote(&self) -> Option<String> {
        Some(self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockScpiServer;

    fn echo(cmd: &str) -> Option<String> {
        cmd.strip_suffix('?').map(|stem| format!("{stem}:OK"))
    }

    #[test]
    fn read_deadline_scales_timeout_with_floor() {
        assert_eq!(read_deadline(Duration::from_secs(2)), Duration::from_secs(5));
        assert_eq!(
            read_deadline(Duration::from_millis(100)),
            Duration::from_millis(2500)
        );
    }

    #[tokio::test]
    async fn persistent_reuses_one_connection() {
        let server = MockScpiServer::start(echo).await.unwrap();
        let mut transport = PersistentTcpTransport::new(server.host(), server.port());

        for _ in 0..5 {
            assert_eq!(transport.query("*IDN?").await.unwrap(), "*IDN:OK");
        }
        transport.write("*RST").await.unwrap();
        assert_eq!(transport.query("MEAS?").await.unwrap(), "MEAS:OK");

        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.command_count(), 7);
    }

    #[tokio::test]
    async fn persistent_reconnects_after_server_drop() {
        let server = MockScpiServer::builder(|cmd: &str| {
            cmd.strip_prefix("ECHO? ").map(|s| s.to_string())
        })
        .drop_after(3)
        .start()
        .await
        .unwrap();
        let mut transport = PersistentTcpTransport::new(server.host(), server.port())
            .with_timeout(Duration::from_millis(500));

        for i in 0..3 {
            let reply = transport.query(&format!("ECHO? {i}")).await.unwrap();
            assert_eq!(reply, i.to_string());
        }
        // Fourth query lands on a dropped session and must be answered correctly
        // after one transparent reconnect.
        let reply = transport.query("ECHO? 3").await.unwrap();
        assert_eq!(reply, "3");
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    async fn persistent_surfaces_unreachable_endpoint() {
        // Bind and immediately release a port so nothing listens on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = PersistentTcpTransport::new("127.0.0.1", port)
            .with_timeout(Duration::from_millis(200));
        let err = transport.query("*IDN?").await.unwrap_err();
        assert!(err.is_connection_fault());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn persistent_times_out_on_silent_instrument() {
        let server = MockScpiServer::start(|_: &str| None).await.unwrap();
        let mut transport = PersistentTcpTransport::new(server.host(), server.port())
            .with_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = transport.query("SILENT?").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        // 2.5 x max(timeout, 1s)
        assert!(started.elapsed() >= Duration::from_millis(2400));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn oneshot_opens_one_connection_per_query() {
        let server = MockScpiServer::start(echo).await.unwrap();
        let mut transport = OneShotTcpTransport::new(server.host(), server.port())
            .with_connect_backoff(Duration::from_millis(5));

        for _ in 0..4 {
            assert_eq!(transport.query("VOLT?").await.unwrap(), "VOLT:OK");
        }
        assert_eq!(server.connection_count(), 4);

        transport.write("OUTP CH1,OFF").await.unwrap();
        assert_eq!(transport.query("VOLT?").await.unwrap(), "VOLT:OK");
        assert_eq!(server.connection_count(), 6);
    }

    #[tokio::test]
    async fn oneshot_bare_read_is_rejected() {
        let mut transport = OneShotTcpTransport::new("127.0.0.1", 1);
        let err = transport.read().await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn timeout_adjustment_is_visible() {
        let mut transport = PersistentTcpTransport::new("127.0.0.1", 5025);
        transport.set_timeout(Duration::from_secs(10));
        assert_eq!(transport.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(transport.remote().as_deref(), Some("127.0.0.1:5025"));
    }
}
