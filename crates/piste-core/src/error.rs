//! Error types for piste-core

use thiserror::Error;

/// Result type alias using piste-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in piste-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry not found
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
