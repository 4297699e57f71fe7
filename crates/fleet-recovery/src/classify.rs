//! Error classification for intelligent recovery.
//!
//! Categorizes the raw error text from a failed health check by
//! substring match, so recovery can remediate the cause (free a port,
//! wait out a slow dependency) instead of restarting blindly.

/// Category of a health check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Something else is bound to the service's port.
    PortConflict,
    /// The service answered too slowly or not at all.
    Timeout,
    /// Nothing is listening at all.
    ConnectionRefused,
    /// A downstream dependency (database, cache, upstream API) failed.
    DependencyFailure,
    Unknown,
}

/// Classify an error string by substring match (case-insensitive).
pub fn classify(error: &str) -> ErrorCategory {
    let text = error.to_lowercase();

    if text.contains("eaddrinuse") || text.contains("address already in use") {
        ErrorCategory::PortConflict
    } else if text.contains("timeout") || text.contains("timed out") || text.contains("etimedout")
    {
        ErrorCategory::Timeout
    } else if text.contains("econnrefused") || text.contains("connection refused") {
        ErrorCategory::ConnectionRefused
    } else if text.contains("database")
        || text.contains("redis")
        || text.contains("upstream")
        || text.contains("dependency")
    {
        ErrorCategory::DependencyFailure
    } else {
        ErrorCategory::Unknown
    }
}
