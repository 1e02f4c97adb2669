//! Cache error types

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache-related errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// A value could not be encoded for storage
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A stored value could not be decoded
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Key template could not be parsed
    #[error("Invalid key template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// TTL specification could not be parsed
    #[error("Invalid TTL '{0}': {1}")]
    InvalidTtl(String, String),

    /// Invalid configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// Backend-specific error (storage unavailable, connection lost, ...)
    #[error("Cache backend error: {0}")]
    BackendError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CacheError {
    /// Build a backend error from anything printable
    pub fn backend(message: impl Into<String>) -> Self {
        CacheError::BackendError(message.into())
    }

    /// Whether the error came from the storage layer rather than from encoding
    pub fn is_backend(&self) -> bool {
        matches!(self, CacheError::BackendError(_) | CacheError::IoError(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() {
            CacheError::DeserializationError(err.to_string())
        } else {
            CacheError::SerializationError(err.to_string())
        }
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::InvalidConfiguration(err.to_string())
    }
}
