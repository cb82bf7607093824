//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the bench runner.
//! Using the `thiserror` crate, it provides a centralized way to classify the
//! faults described by the run lifecycle:
//!
//! - **`Configuration`** / **`Plan`**: fatal at startup, reported before any
//!   instrument I/O happens.
//! - **`Transport`**: a connection or device fault that survived the
//!   transport's own retry policy.
//! - **`Instrument`**: an instrument answered, but not in a way the driver
//!   could use.
//! - **`Storage`** / **`Serialization`**: output artifact problems.
//!
//! Safety aborts are deliberately *not* errors; see
//! [`crate::experiment::RunOutcome`].

use crate::transport::TransportError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Plan error: {0}")]
    Plan(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether this error belongs to the startup configuration class.
    ///
    /// The binary maps these to a distinct exit status so scripted callers can
    /// tell a bad invocation from a hardware failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::Configuration(_)
                | DaqError::Plan(_)
                | DaqError::FeatureNotEnabled(_)
        )
    }
}

impl From<serde_yaml::Error> for DaqError {
    fn from(value: serde_yaml::Error) -> Self {
        DaqError::Plan(value.to_string())
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
