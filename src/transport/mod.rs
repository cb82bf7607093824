//! Instrument transports.
//!
//! Every bench instrument speaks newline-terminated text, but the physical
//! link differs: a TCP socket (kept open or reopened per command), the Linux
//! `usbtmc` character device, or a serial USB-to-I2C dongle (see
//! [`crate::hardware::ens210`]). The [`Transport`] trait hides those
//! differences behind `write`/`read`/`query`, and each implementation owns its
//! own fault recovery so drivers never see a transient fault.
//!
//! # Contract
//!
//! - `write` sends one command and a trailing `\n`. No response is read.
//! - `read` returns one response with surrounding whitespace trimmed. Bytes
//!   that are not valid UTF-8 are replaced, never reported as an error.
//! - `query` is `write` followed by `read`, atomic from the caller's point of
//!   view: a failure either surfaces as an error or yields a best-effort
//!   response, and never leaves stale bytes for the next call.
//! - `set_timeout` is always safe to call, even where a timeout means nothing.
//!
//! # Available transports
//!
//! | Type | Link | Recovery |
//! |------|------|----------|
//! | [`PersistentTcpTransport`] | one long-lived socket | reconnect once and retry |
//! | [`OneShotTcpTransport`] | fresh socket per command | paced connects, retry send once |
//! | [`UsbTmcTransport`] | `/dev/usbtmcN` | 3 write attempts, 3 read attempts |
//! | [`LoggingTransport`] | wraps any of the above | mirrors I/O to the protocol log |

pub mod logging;
pub mod tcp;
pub mod usbtmc;

pub use logging::{LoggingTransport, ProtocolLog, ProtocolOp, ProtocolRecord};
pub use tcp::{OneShotTcpTransport, PersistentTcpTransport};
pub use usbtmc::UsbTmcTransport;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default SCPI-over-TCP port (the "raw socket" port used by most vendors).
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Errors surfaced by a transport after its own recovery policy gave up.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote endpoint could not be reached.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// `host:port` or device path.
        endpoint: String,
        /// Underlying socket or file error.
        source: std::io::Error,
    },

    /// An established link failed mid-operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No complete response arrived before the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The peer closed the link before answering.
    #[error("connection to {0} closed by peer")]
    Closed(String),

    /// The operation needs a link this transport does not hold.
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl TransportError {
    /// Faults that a fresh connection is expected to cure.
    ///
    /// A timeout is not one of them: the instrument was reachable and simply
    /// did not answer, so resending would only double the wait.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. } | TransportError::Io(_) | TransportError::Closed(_)
        )
    }
}

/// Uniform command/response link to one instrument.
///
/// Each transport instance is driven by exactly one owner at a time, hence the
/// `&mut self` receivers; drivers that need `&self` APIs wrap their transport
/// in a `tokio::sync::Mutex`.
#[async_trait]
pub trait Transport: Send {
    /// Send a command that produces no response.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Block until one newline-terminated response is available.
    async fn read(&mut self) -> Result<String, TransportError>;

    /// Send a command and read its response.
    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command).await?;
        self.read().await
    }

    /// Change the effective I/O timeout for subsequent operations.
    fn set_timeout(&mut self, _timeout: Duration) {}

    /// The effective I/O timeout, where the transport has one.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Description of the far end (`host:port`, device path) if known.
    fn remote(&self) -> Option<String> {
        None
    }

    /// Release any open connection or handle. The next operation reopens it.
    async fn close(&mut self) {}
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        (**self).write(command).await
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        (**self).read().await
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        (**self).query(command).await
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Option<Duration> {
        (**self).timeout()
    }

    fn remote(&self) -> Option<String> {
        (**self).remote()
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// Append the command terminator.
pub(crate) fn frame_command(command: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(command.len() + 1);
    payload.extend_from_slice(command.as_bytes());
    payload.push(b'\n');
    payload
}

/// Lossy decode of a raw response, trimmed.
pub(crate) fn decode_response(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}
