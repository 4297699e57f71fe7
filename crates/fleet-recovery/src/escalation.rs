//! Escalation journal — the human-facing record of exhausted recovery.
//!
//! When automated recovery gives up on a service, one structured record
//! is appended here and the notification callback fires. This is the
//! only path designed to interrupt a human.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RecoveryError, RecoveryResult};

/// One escalation journal line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationRecord {
    pub service: String,
    pub consecutive_failures: u32,
    pub restart_count: u32,
    pub last_error: Option<String>,
    /// Unix timestamp (ms).
    pub timestamp: u64,
}

/// Line-oriented append-only escalation journal.
#[derive(Clone)]
pub struct EscalationLog {
    path: Option<PathBuf>,
}

impl EscalationLog {
    /// Journal appending to the given file.
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    /// No-op journal (for tests).
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one record as a JSON line.
    pub fn append(&self, record: &EscalationRecord) -> RecoveryResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let line =
            serde_json::to_string(record).map_err(|e| RecoveryError::Escalation(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RecoveryError::Escalation(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| RecoveryError::Escalation(e.to_string()))?;
        Ok(())
    }

    /// Append, downgrading failures to a warning — a broken journal must
    /// not block the notification path.
    pub fn append_best_effort(&self, record: &EscalationRecord) {
        if let Err(e) = self.append(record) {
            warn!(service = %record.service, error = %e, "escalation append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_structured_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escalations.log");
        let log = EscalationLog::new(&path);

        log.append(&EscalationRecord {
            service: "vocal_coach".to_string(),
            consecutive_failures: 4,
            restart_count: 3,
            last_error: Some("connection refused".to_string()),
            timestamp: 1_700_000_000_000,
        })
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let record: EscalationRecord = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(record.service, "vocal_coach");
        assert_eq!(record.consecutive_failures, 4);
    }
}
