//! Bench configuration using Figment
//!
//! Settings that describe the bench rather than the test: log output, socket
//! and device timeouts, sensor dongle parameters. Test plans live in YAML and
//! are handled by [`crate::experiment::plan`].
//!
//! Configuration is layered, later sources winning:
//! 1. compiled defaults
//! 2. `sigbench.toml` (or the file given with `--config`), if present
//! 3. environment variables prefixed `SIGBENCH_`, nested keys split on `__`
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [tcp]
//! timeout = "3s"
//! oneshot_backoff = "100ms"
//!
//! [sensor]
//! addr = 0x40
//! ```
//!
//! `SIGBENCH_TCP__TIMEOUT=10s` overrides `tcp.timeout`.

use crate::error::{AppResult, DaqError};
use crate::transport::tcp::DEFAULT_TCP_TIMEOUT;
use crate::transport::usbtmc::{
    DEFAULT_INTER_QUERY_DELAY, DEFAULT_SYSFS_ROOT, DEFAULT_USBTMC_TIMEOUT,
};
use crate::transport::DEFAULT_SCPI_PORT;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "sigbench.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SIGBENCH_";

/// Top-level bench configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BenchConfig {
    /// Console logging
    pub logging: LoggingConfig,
    /// SCPI over TCP
    pub tcp: TcpConfig,
    /// SCPI over USBTMC
    pub usbtmc: UsbTmcConfig,
    /// ENS210 dongle
    pub sensor: SensorConfig,
}

/// Console logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Port used when a target gives only a host
    pub default_port: u16,
    /// Socket timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause before every connect in one-shot mode
    #[serde(with = "humantime_serde")]
    pub oneshot_backoff: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_SCPI_PORT,
            timeout: DEFAULT_TCP_TIMEOUT,
            oneshot_backoff: Duration::from_millis(50),
        }
    }
}

/// USBTMC transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbTmcConfig {
    /// Kernel I/O timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause between write and read of a query
    #[serde(with = "humantime_serde")]
    pub inter_query_delay: Duration,
    /// sysfs class directory for driver tuning
    pub sysfs_root: PathBuf,
}

impl Default for UsbTmcConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_USBTMC_TIMEOUT,
            inter_query_delay: DEFAULT_INTER_QUERY_DELAY,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }
}

/// ENS210 dongle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial baud rate
    pub baud: u32,
    /// 7-bit I2C address
    pub addr: u8,
    /// Serial port timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Accept readings whose CRC failed
    pub ignore_crc: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            addr: crate::hardware::ens210::DEFAULT_ADDR,
            timeout: Duration::from_millis(500),
            ignore_crc: false,
        }
    }
}

impl BenchConfig {
    /// Defaults, then `sigbench.toml` if present, then the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Defaults, then `path` if present, then the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate().map_err(DaqError::Configuration)?;
        Ok(config)
    }

    /// Layered provider, exposed so callers can merge further sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        for (name, value) in [
            ("tcp.timeout", self.tcp.timeout),
            ("usbtmc.timeout", self.usbtmc.timeout),
            ("sensor.timeout", self.sensor.timeout),
        ] {
            if value.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        if self.tcp.default_port == 0 {
            return Err("tcp.default_port must be non-zero".to_string());
        }

        if self.sensor.addr > 0x7F {
            return Err(format!(
                "Invalid sensor.addr 0x{:02X}. I2C addresses are 7-bit (0x00-0x7F)",
                self.sensor.addr
            ));
        }

        Ok(())
    }
}
