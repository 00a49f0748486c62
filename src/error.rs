//! Error types for the ZSL capture pipeline.
//!
//! Every fallible operation in the crate returns [`ZslError`]. Errors that reach a
//! [`ZslCallback`](crate::pipeline::ZslCallback) are flattened into one of the four
//! outward [`ErrorCode`]s.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, ZslError>;

/// Error codes delivered through `on_zsl_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    NoMatchedImage = -1,
    Unknown = -2,
    InternalState = -3,
    InvalidArgument = -4,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug)]
pub enum ZslError {
    #[error("No buffered frame matches the requested capture")]
    NoMatchedImage,

    #[error("Too many frames are still in flight")]
    Busy,

    #[error("ZSL manager is not set up")]
    Uninitialized,

    #[error("Invalid internal state: {0}")]
    InternalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Frame pool exhausted ({capacity} slots in use)")]
    PoolExhausted { capacity: usize },

    #[error("ZSL worker is no longer running")]
    Disconnected,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ZslError {
    /// Outward code reported to capture callbacks.
    pub fn code(&self) -> ErrorCode {
        match self {
            ZslError::NoMatchedImage => ErrorCode::NoMatchedImage,
            ZslError::Busy | ZslError::Uninitialized | ZslError::InternalState(_) => {
                ErrorCode::InternalState
            }
            ZslError::InvalidArgument(_) | ZslError::Config(_) => ErrorCode::InvalidArgument,
            ZslError::PoolExhausted { .. } | ZslError::Disconnected | ZslError::Unknown(_) => {
                ErrorCode::Unknown
            }
        }
    }
}
