//! # sigbench
//!
//! Unattended bench automation for SCPI instruments: a Siglent power supply,
//! multimeter and oscilloscope plus an ENS210 temperature/humidity probe behind
//! a serial USB-to-I2C dongle. Long endurance plans run step by step while
//! safety interlocks switch the supply off as soon as a limit is crossed.
//!
//! ## Crate Structure
//!
//! - **`transport`**: persistent and one-shot TCP, Linux USBTMC, and the
//!   protocol-logging decorator. Each transport owns its retry policy.
//! - **`hardware`**: one capability trait per instrument role, the Siglent and
//!   ENS210 drivers, target parsing, USBTMC discovery and mocks.
//! - **`safety`**: sliding windows and the abort conditions evaluated on every
//!   tick. Pure, no I/O.
//! - **`experiment`**: the YAML plan format and the plan runner.
//! - **`data`**: the per-tick output record and CSV / Arrow sinks.
//! - **`config`**: bench settings layered from defaults, TOML and environment.
//! - **`tracing_init`**: console logging setup.
//! - **`error`**: the crate-wide `DaqError`.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod safety;
pub mod tracing_init;
pub mod transport;
