//! Error types for fleet graceful shutdown.

use thiserror::Error;

/// Result type alias for shutdown operations.
pub type ShutdownResult<T> = Result<T, ShutdownError>;

/// Errors that can occur during shutdown.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown already initiated")]
    AlreadyInitiated,
}
