//! Error types for the fleet service registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("failed to persist registry: {0}")]
    Persist(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}
