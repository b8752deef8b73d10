//! Centralized error types for A3S Config Service

use crate::parser::ParseError;
use thiserror::Error;

/// Config service error types
#[derive(Debug, Error)]
pub enum ConfigServiceError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource content could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A required resource does not exist
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Content provider failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Pub/sub transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, ConfigServiceError>;
