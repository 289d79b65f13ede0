//! Error taxonomy shared by the codec, bootstrapper, normalizer and transfer pipeline

use thiserror::Error;

/// Errors raised by the telemetry core
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Bad caller input (empty password, malformed solution, unknown session)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Wrong key or corrupt ciphertext
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Malformed JSON
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Remote store unreachable or insert rejected
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type TelemetryResult<T> = std::result::Result<T, TelemetryError>;

impl TelemetryError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        TelemetryError::InvalidArgument(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        TelemetryError::Transfer(msg.into())
    }
}
