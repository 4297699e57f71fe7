//! Error types for fleet distributed locking.

use thiserror::Error;

/// Result type alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("store error: {0}")]
    Store(#[from] fleet_store::StoreError),

    #[error("lock '{key}' not acquired after {attempts} attempt(s)")]
    NotAcquired { key: String, attempts: u32 },
}
