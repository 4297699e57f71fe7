//! Error types for the fleet service controller.

use thiserror::Error;

/// Result type alias for controller operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur during controller operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {service}: {reason}")]
    Spawn { service: String, reason: String },

    #[error("registry error: {0}")]
    Registry(#[from] fleet_registry::RegistryError),

    #[error("audit log error: {0}")]
    Audit(String),
}
