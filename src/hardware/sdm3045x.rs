//! Siglent SDM3045X 4½-digit multimeter.

use super::capabilities::Multimeter;
use super::scpi::{parse_first_float, ScpiInstrument};
use crate::transport::Transport;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Mutex;

/// Driver for the SDM3045X.
///
/// Readings are taken one at a time: `ABORt`, `INIT`, then `READ?`. Some
/// firmware revisions answer `READ?` with nothing after a function change, so
/// `FETCh?` and (for DC volts) `MEAS:VOLT:DC?` are tried in turn.
pub struct Sdm3045x {
    scpi: ScpiInstrument,
    function: Mutex<String>,
}

impl Sdm3045x {
    /// Create a driver on an already constructed transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(transport, "sdm3045x"),
            function: Mutex::new(String::new()),
        }
    }

    /// Shared SCPI commands.
    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }

    fn is_dc_volts(&self) -> bool {
        match self.function.lock() {
            Ok(f) => is_dc_volts(&f),
            Err(poisoned) => is_dc_volts(&poisoned.into_inner()),
        }
    }
}

fn is_dc_volts(function: &str) -> bool {
    function.to_ascii_uppercase().starts_with("VOLT:DC")
}

#[async_trait]
impl Multimeter for Sdm3045x {
    async fn set_function(&self, function: &str, range: Option<f64>) -> Result<()> {
        if let Ok(mut f) = self.function.lock() {
            *f = function.to_string();
        }
        self.scpi.write(&format!("FUNC \"{function}\"")).await?;
        if is_dc_volts(function) {
            let conf = match range {
                Some(r) => format!("CONF:VOLT:DC {r}"),
                None => "CONF:VOLT:DC".to_string(),
            };
            self.scpi.write(&conf).await?;
        }
        // Immediate single-sample trigger so READ? returns exactly one value.
        for command in ["TRIG:COUN 1", "TRIG:SOUR IMM", "SAMP:COUN 1"] {
            self.scpi.try_write(command).await;
        }
        Ok(())
    }

    async fn read(&self) -> Result<f64> {
        self.scpi.write("ABORt").await?;
        self.scpi.write("INIT").await?;

        let mut response = self.scpi.query("READ?").await?;
        if response.is_empty() {
            response = self.scpi.query("FETCh?").await?;
        }
        if response.is_empty() && self.is_dc_volts() {
            response = self.scpi.query("MEAS:VOLT:DC?").await?;
        }
        if let Some(value) = parse_first_float(&response) {
            return Ok(value);
        }

        let last_error = self
            .scpi
            .error()
            .await
            .unwrap_or_else(|_| "unavailable".to_string());
        bail!(
            "SDM3045X returned no data for measurement (response '{}', last error: {})",
            response,
            last_error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_volts_detection() {
        assert!(is_dc_volts("VOLT:DC"));
        assert!(is_dc_volts("volt:dc"));
        assert!(!is_dc_volts("CURR:DC"));
        assert!(!is_dc_volts(""));
    }
}
