//! Error handling for the IM server

use thiserror::Error;

use crate::protocol::{ErrorCode, ErrorMessage, FrameError};
use crate::store::StoreError;

/// Result type alias for IM operations
pub type Result<T> = std::result::Result<T, ImError>;

/// IM server error types
#[derive(Debug, Error)]
pub enum ImError {
    /// Socket-level failure
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Bytes on the wire did not form a valid frame or payload
    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// The credential store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The peer closed the connection
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Operation did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The server answered with an `Error` frame
    #[error("Server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    /// Server internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            ImError::Network(_) => 1000,
            ImError::Protocol(_) => 1001,
            ImError::Store(_) => 1002,
            ImError::Closed(_) => 1005,
            ImError::Timeout(_) => 1006,
            ImError::Server { .. } => 1008,
            ImError::Internal(_) => 1009,
        }
    }

    /// Create a connection closed error
    pub fn closed<T: Into<String>>(msg: T) -> Self {
        ImError::Closed(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ImError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ImError::Internal(msg.into())
    }
}

impl From<ErrorMessage> for ImError {
    fn from(err: ErrorMessage) -> Self {
        ImError::Server {
            code: err.code,
            message: err.message,
        }
    }
}
