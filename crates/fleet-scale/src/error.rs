//! Error types for fleet autoscaling.

use thiserror::Error;

/// Result type alias for scaling operations.
pub type ScaleResult<T> = Result<T, ScaleError>;

/// Errors that can occur during scaling operations.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("metrics error: {0}")]
    Metrics(String),

    #[error(transparent)]
    Orchestrator(#[from] anyhow::Error),

    #[error("scaling journal error: {0}")]
    Journal(String),
}
