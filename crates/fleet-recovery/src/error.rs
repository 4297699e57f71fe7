//! Error types for fleet auto-recovery.

use thiserror::Error;

/// Result type alias for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Errors that can occur during recovery operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("registry error: {0}")]
    Registry(#[from] fleet_registry::RegistryError),

    #[error("escalation log error: {0}")]
    Escalation(String),
}
