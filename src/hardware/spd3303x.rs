//! Siglent SPD3303X / SPD3303X-E programmable DC supply.
//!
//! Channels are addressed explicitly (`CH1:VOLT 5.0`), which every firmware
//! revision accepts. Output enable is the exception: revisions disagree on the
//! syntax, so `output_on` sends each known variant and ignores rejections.

use super::capabilities::PowerSupply;
use super::scpi::ScpiInstrument;
use crate::transport::Transport;
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// Driver for the SPD3303X family.
pub struct Spd3303x {
    scpi: ScpiInstrument,
}

impl Spd3303x {
    /// Create a driver on an already constructed transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(transport, "spd3303x"),
        }
    }

    /// Shared SCPI commands (`*IDN?`, `SYST:ERR?`, ...).
    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }
}

/// Numeric index of `CH1`..`CH3`, used by the `OUTPutN:STATe` syntax.
fn channel_number(channel: &str) -> Option<u8> {
    match channel.to_ascii_uppercase().as_str() {
        "CH1" => Some(1),
        "CH2" => Some(2),
        "CH3" => Some(3),
        _ => None,
    }
}

/// Output-enable variants in the order they are tried.
fn output_enable_commands(channel: &str) -> Vec<String> {
    let mut commands = vec![
        "OUTP ON".to_string(),
        format!("OUTP {channel},ON"),
        "OUTPut:STATe ON".to_string(),
    ];
    if let Some(n) = channel_number(channel) {
        commands.push(format!("OUTPut{n}:STATe ON"));
    }
    commands
}

#[async_trait]
impl PowerSupply for Spd3303x {
    async fn set_voltage(&self, channel: &str, volts: f64) -> Result<()> {
        self.scpi.write(&format!("{channel}:VOLT {volts}")).await
    }

    async fn set_current(&self, channel: &str, amps: f64) -> Result<()> {
        self.scpi.write(&format!("{channel}:CURR {amps}")).await
    }

    async fn output_on(&self, channel: &str) -> Result<()> {
        self.scpi.try_write("SYST:REM").await;
        self.scpi.try_write(&format!("INST {channel}")).await;
        for command in output_enable_commands(channel) {
            self.scpi.try_write(&command).await;
        }
        if let Err(e) = self.scpi.query("*OPC?").await {
            debug!(error = %e, "*OPC? not answered after output enable");
        }
        Ok(())
    }

    async fn output_off(&self, channel: &str) -> Result<()> {
        self.scpi.write(&format!("OUTP {channel},OFF")).await
    }

    async fn measure_current(&self, channel: &str) -> Result<f64> {
        self.scpi.query_f64(&format!("MEAS:CURR? {channel}")).await
    }

    async fn measure_voltage(&self, channel: &str) -> Result<f64> {
        self.scpi.query_f64(&format!("MEAS:VOLT? {channel}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_variants_include_numbered_state() {
        let cmds = output_enable_commands("ch2");
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[1], "OUTP ch2,ON");
        assert_eq!(cmds[3], "OUTPut2:STATe ON");
    }

    #[test]
    fn unknown_channel_skips_numbered_state() {
        assert_eq!(output_enable_commands("OUT").len(), 3);
    }
}
