//! Error types for core parsing and validation.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing descriptors, quantities, or configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid quantity {value:?}: {reason}")]
    InvalidQuantity { value: String, reason: &'static str },

    #[error("invalid service name {0:?}: must be a lowercase DNS label of at most 39 characters")]
    InvalidName(String),

    #[error("invalid storage provider reference {0:?}")]
    InvalidProviderRef(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to encode descriptor: {0}")]
    Encode(String),

    #[error("failed to decode descriptor: {0}")]
    Decode(String),
}
