//! Instrument Capabilities
//!
//! One narrow trait per bench role. The plan runner depends only on these
//! traits, never on a concrete driver, so a run can mix real instruments,
//! TCP mocks and in-process mocks freely:
//!
//! - A bench supply implements [`PowerSupply`]
//! - A DMM implements [`Multimeter`]
//! - A scope implements [`Oscilloscope`]
//! - A temperature/humidity probe implements [`HumiditySensor`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Takes `&self`; drivers serialize access to their transport internally
//!
//! Channels and functions are passed as the instrument's own SCPI tokens
//! (`"CH1"`, `"VOLT:DC"`, `"C1"`). The runner does not interpret them.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn ramp<P: PowerSupply + ?Sized>(psu: &P) -> Result<f64> {
//!     psu.set_current("CH1", 0.5).await?;
//!     psu.set_voltage("CH1", 5.0).await?;
//!     psu.output_on("CH1").await?;
//!     psu.measure_current("CH1").await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Power supply
// =============================================================================

/// Programmable DC supply with per-channel setpoints.
#[async_trait]
pub trait PowerSupply: Send + Sync {
    /// Program the voltage setpoint of `channel`, in volts.
    async fn set_voltage(&self, channel: &str, volts: f64) -> Result<()>;

    /// Program the current limit of `channel`, in amperes.
    async fn set_current(&self, channel: &str, amps: f64) -> Result<()>;

    /// Enable the output of `channel`.
    async fn output_on(&self, channel: &str) -> Result<()>;

    /// Disable the output of `channel`.
    ///
    /// This is the shutdown path of every safety abort. Implementations should
    /// make it as cheap and unconditional as the instrument allows.
    async fn output_off(&self, channel: &str) -> Result<()>;

    /// Measured output current of `channel`, in amperes.
    async fn measure_current(&self, channel: &str) -> Result<f64>;

    /// Measured output voltage of `channel`, in volts.
    async fn measure_voltage(&self, channel: &str) -> Result<f64> {
        anyhow::bail!("voltage readback on {} is not supported", channel)
    }
}

// =============================================================================
// Multimeter
// =============================================================================

/// Single-reading digital multimeter.
#[async_trait]
pub trait Multimeter: Send + Sync {
    /// Select the measurement function (`"VOLT:DC"`, `"CURR:DC"`, ...) and an
    /// optional fixed range. `None` leaves autoranging on.
    async fn set_function(&self, function: &str, range: Option<f64>) -> Result<()>;

    /// Trigger and return one reading in the units of the current function.
    async fn read(&self) -> Result<f64>;
}

// =============================================================================
// Oscilloscope
// =============================================================================

/// Vertical setup of one scope channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSetup {
    /// Channel token, e.g. `"C1"`.
    pub channel: String,
    /// Trace enabled.
    pub enabled: bool,
    /// Volts per division.
    pub scale: Option<f64>,
    /// Vertical offset in volts.
    pub offset: Option<f64>,
    /// Probe attenuation factor (1, 10, ...).
    pub probe: Option<f64>,
}

impl ChannelSetup {
    /// Enabled channel with instrument defaults for everything else.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            enabled: true,
            scale: None,
            offset: None,
            probe: None,
        }
    }
}

/// Edge-trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerSlope {
    /// Rising edge.
    Pos,
    /// Falling edge.
    Neg,
}

impl TriggerSlope {
    /// SCPI token for the slope.
    pub fn as_scpi(&self) -> &'static str {
        match self {
            TriggerSlope::Pos => "POS",
            TriggerSlope::Neg => "NEG",
        }
    }
}

/// Digital storage oscilloscope used for built-in amplitude measurements.
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Apply the vertical setup of one channel.
    async fn set_channel(&self, setup: &ChannelSetup) -> Result<()>;

    /// Horizontal scale in seconds per division, optionally with a memory
    /// depth in points.
    async fn set_timebase(&self, tdiv: f64, points: Option<u32>) -> Result<()>;

    /// Edge trigger on `source` at `level` volts.
    async fn set_trigger_edge(&self, source: &str, level: f64, slope: TriggerSlope) -> Result<()>;

    /// Peak-to-peak amplitude of `channel`, in volts.
    async fn measure_vpp(&self, channel: &str) -> Result<f64>;

    /// RMS amplitude of `channel`, in volts.
    async fn measure_vrms(&self, channel: &str) -> Result<f64>;

    /// Resume continuous acquisition.
    async fn run(&self) -> Result<()>;
}

// =============================================================================
// Temperature / humidity sensor
// =============================================================================

/// One decoded temperature/humidity conversion.
///
/// A reading is always produced, even when the conversion failed; the flags
/// say which parts can be trusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Temperature in degrees Celsius.
    pub temp_c: Option<f64>,
    /// Temperature in kelvin.
    pub temp_k: Option<f64>,
    /// Relative humidity in percent.
    pub rh_pct: Option<f64>,
    /// Both words valid and checksums acceptable.
    pub ok: bool,
    /// Temperature valid bit.
    pub t_valid: bool,
    /// Humidity valid bit.
    pub h_valid: bool,
    /// Temperature CRC matched.
    pub t_crc_ok: bool,
    /// Humidity CRC matched.
    pub h_crc_ok: bool,
}

impl SensorReading {
    /// Reading reported when the sensor could not be read at all.
    pub fn degraded() -> Self {
        Self::default()
    }
}

/// Temperature and relative-humidity probe.
#[async_trait]
pub trait HumiditySensor: Send + Sync {
    /// Run one conversion and decode it.
    async fn read(&self) -> Result<SensorReading>;

    /// Release the underlying port.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_reading_has_no_values() {
        let r = SensorReading::degraded();
        assert!(r.temp_c.is_none() && r.rh_pct.is_none());
        assert!(!r.ok && !r.t_crc_ok && !r.h_crc_ok);
    }

    #[test]
    fn slope_tokens() {
        assert_eq!(TriggerSlope::Pos.as_scpi(), "POS");
        let slope: TriggerSlope = serde_yaml::from_str("NEG").unwrap();
        assert_eq!(slope, TriggerSlope::Neg);
    }
}
