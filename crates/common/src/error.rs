//! Common error types for floaty components.

use std::fmt;

/// A specialized Result type for floaty operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for floaty operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("FIFO error: {0}")]
    Fifo(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new lock error.
    pub fn lock(msg: impl fmt::Display) -> Self {
        Error::Lock(msg.to_string())
    }

    /// Create a new parse error.
    pub fn parse(msg: impl fmt::Display) -> Self {
        Error::Parse(msg.to_string())
    }

    /// Create a new process error.
    pub fn process(msg: impl fmt::Display) -> Self {
        Error::Process(msg.to_string())
    }

    /// Create a new provider error.
    pub fn provider(msg: impl fmt::Display) -> Self {
        Error::Provider(msg.to_string())
    }

    /// Create a new FIFO error.
    pub fn fifo(msg: impl fmt::Display) -> Self {
        Error::Fifo(msg.to_string())
    }

    /// Create a new API error from an HTTP status code.
    pub fn api(status: u16, message: impl fmt::Display) -> Self {
        Error::Api {
            status,
            message: message.to_string(),
        }
    }

    /// HTTP status code carried by API errors.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
