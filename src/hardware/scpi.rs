//! Shared SCPI instrument base.
//!
//! [`ScpiInstrument`] owns one transport behind an async mutex and provides the
//! IEEE 488.2 common commands plus typed query helpers. Concrete drivers embed
//! it and add their instrument-specific command mapping.

use crate::transport::Transport;
use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[allow(clippy::expect_used)]
static FLOAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("Invalid float regex"));

/// Extract the first floating-point number from an instrument response.
///
/// Instruments decorate numbers with units and labels (`"0.250A"`,
/// `"VDC +4.99812E+00"`); the first numeric token is the value. Responses
/// that echo a channel header before the value need [`parse_labeled_float`].
pub fn parse_first_float(text: &str) -> Option<f64> {
    FLOAT_RE.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Every number in `text`, in order.
pub fn parse_floats(text: &str) -> impl Iterator<Item = f64> + '_ {
    FLOAT_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
}

/// Extract the value of a `HEADER ITEM,VALUE` response.
///
/// `"C1:PAVA PKPK,3.20E+00V"` carries a digit in its header, so the number is
/// taken from after the last comma when there is one.
pub fn parse_labeled_float(text: &str) -> Option<f64> {
    let value = text.rsplit_once(',').map_or(text, |(_, v)| v);
    parse_first_float(value)
}

/// Transport plus name, with the commands every SCPI instrument understands.
pub struct ScpiInstrument {
    transport: Mutex<Box<dyn Transport>>,
    name: String,
}

impl ScpiInstrument {
    /// Wrap a transport. `name` appears in error context and logs.
    pub fn new(transport: Box<dyn Transport>, name: impl Into<String>) -> Self {
        Self {
            transport: Mutex::new(transport),
            name: name.into(),
        }
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command.
    pub async fn write(&self, command: &str) -> Result<()> {
        debug!(instrument = %self.name, command, "write");
        self.transport
            .lock()
            .await
            .write(command)
            .await
            .with_context(|| format!("{}: write '{}'", self.name, command))
    }

    /// Send a command, logging and discarding any failure.
    pub async fn try_write(&self, command: &str) -> bool {
        match self.write(command).await {
            Ok(()) => true,
            Err(e) => {
                debug!(instrument = %self.name, command, error = %e, "optional command failed");
                false
            }
        }
    }

    /// Send a query and return the trimmed response.
    pub async fn query(&self, command: &str) -> Result<String> {
        let response = self
            .transport
            .lock()
            .await
            .query(command)
            .await
            .with_context(|| format!("{}: query '{}'", self.name, command))?;
        debug!(instrument = %self.name, command, response = %response, "query");
        Ok(response)
    }

    /// Query and parse the whole response as a float.
    pub async fn query_f64(&self, command: &str) -> Result<f64> {
        let response = self.query(command).await?;
        response.trim().parse::<f64>().map_err(|_| {
            anyhow!(
                "{}: '{}' returned non-numeric response '{}'",
                self.name,
                command,
                response
            )
        })
    }

    /// Query and extract the first number in the response, if any.
    pub async fn query_number(&self, command: &str) -> Result<Option<f64>> {
        Ok(parse_first_float(&self.query(command).await?))
    }

    /// Change the transport timeout.
    pub async fn set_timeout(&self, timeout: Duration) {
        self.transport.lock().await.set_timeout(timeout);
    }

    /// Current transport timeout, if the transport has one.
    pub async fn timeout(&self) -> Option<Duration> {
        self.transport.lock().await.timeout()
    }

    /// `*IDN?`
    pub async fn idn(&self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// `*RST`
    pub async fn reset(&self) -> Result<()> {
        self.write("*RST").await
    }

    /// `*CLS`
    pub async fn clear(&self) -> Result<()> {
        self.write("*CLS").await
    }

    /// `SYST:ERR?`
    pub async fn error(&self) -> Result<String> {
        self.query("SYST:ERR?").await
    }

    /// Release the transport connection.
    pub async fn close(&self) {
        self.transport.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_float_in_decorated_responses() {
        assert_eq!(parse_first_float("4.99812"), Some(4.99812));
        assert_eq!(parse_first_float("0.250A"), Some(0.25));
        assert_eq!(parse_first_float("-2.5e-3"), Some(-0.0025));
        assert_eq!(parse_first_float("****"), None);
    }

    #[test]
    fn labeled_float_skips_channel_header() {
        assert_eq!(parse_labeled_float("C1:PAVA PKPK,3.20E+00V"), Some(3.2));
        assert_eq!(parse_labeled_float("C2:PAVA RMS,1.131E-01V"), Some(0.1131));
        assert_eq!(parse_labeled_float("1.5"), Some(1.5));
        assert_eq!(parse_labeled_float("C1:PAVA PKPK,****"), None);
    }
}
