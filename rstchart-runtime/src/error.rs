//! Runtime error types.

use crate::config::ConfigError;
use rstchart_core::CoreError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver channel closed")]
    ChannelClosed,
}

impl RuntimeError {
    /// Stable code for logs and exit messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Io(_) => "IO_ERROR",
            RuntimeError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}
