//! Custom error types for mtup.

use thiserror::Error;

/// Errors that can occur while talking to or upgrading a device.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection timed out: {0}")]
    ConnectTimeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Unable to connect to {endpoint} after {attempts} attempts")]
    ConnectionExhausted { endpoint: String, attempts: u32 },

    #[error("Authentication failed for {0}")]
    Authentication(String),

    #[error("{field} not found in {output} output")]
    MissingField {
        field: &'static str,
        output: &'static str,
    },

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Firmware validation failed: {0}")]
    Firmware(String),

    #[error("Upgrade version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("File transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Authentication,
    Parse,
    Validation,
    Configuration,
}

impl Error {
    /// Map the error onto the connectivity/auth/parse/validation/config taxonomy.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectTimeout(_)
            | Self::Connection(_)
            | Self::ConnectionExhausted { .. }
            | Self::Timeout { .. } => ErrorKind::Connectivity,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::MissingField { .. } | Self::InvalidVersion(_) => ErrorKind::Parse,
            Self::Firmware(_) | Self::VersionMismatch { .. } | Self::Transfer(_) | Self::Io(_) => {
                ErrorKind::Validation
            }
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Returns true if a fresh connection attempt may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::Connection(_))
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
