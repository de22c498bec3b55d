//! Error handling for the bluelink CLI

use bluelink_core::BleError;
use thiserror::Error;

use crate::config::ConfigError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Whether the command was stopped by the user rather than failing
    pub fn is_interrupt(&self) -> bool {
        matches!(self, CliError::Ble(err) if err.is(bluelink_core::ErrorCode::OPERATION_CANCELLED))
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
