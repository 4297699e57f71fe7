//! Append-only audit journal for controller operations.
//!
//! One JSON line per operation: timestamp, service, operation,
//! success/failure, duration, and error text. The journal is written for
//! offline analysis and is never read back by the system itself.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ControlError, ControlResult};

/// One audit journal line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// Unix timestamp (ms).
    pub timestamp: u64,
    pub service: String,
    pub operation: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Line-oriented append-only journal.
#[derive(Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Journal appending to the given file.
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    /// No-op journal (for tests that don't care about the trail).
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one record as a JSON line.
    pub fn append(&self, record: &AuditRecord) -> ControlResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let line = serde_json::to_string(record).map_err(|e| ControlError::Audit(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ControlError::Audit(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| ControlError::Audit(e.to_string()))?;
        Ok(())
    }

    /// Append, downgrading failures to a warning. Audit trouble must not
    /// fail the operation being audited.
    pub fn append_best_effort(&self, record: &AuditRecord) {
        if let Err(e) = self.append(record) {
            warn!(service = %record.service, error = %e, "audit append failed");
        }
    }
}
