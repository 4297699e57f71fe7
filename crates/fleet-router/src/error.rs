//! Error types for the fleet health router.

use thiserror::Error;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors that can occur during routing operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("store error: {0}")]
    Store(#[from] fleet_store::StoreError),

    #[error("instance record error: {0}")]
    Record(#[from] serde_json::Error),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("no routable instance available")]
    NoInstanceAvailable,
}
