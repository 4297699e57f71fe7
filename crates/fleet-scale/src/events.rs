//! Scaling-event journal.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ScaleError, ScaleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// One scaling journal line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub service: String,
    pub direction: ScaleDirection,
    pub from_replicas: u32,
    pub to_replicas: u32,
    /// The max load ratio that drove the decision.
    pub load_ratio: f64,
    /// Unix timestamp (ms).
    pub timestamp: u64,
}

/// Line-oriented append-only scaling journal.
#[derive(Clone)]
pub struct ScalingJournal {
    path: Option<PathBuf>,
}

impl ScalingJournal {
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    /// No-op journal (for tests).
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one event as a JSON line.
    pub fn append(&self, event: &ScalingEvent) -> ScaleResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let line =
            serde_json::to_string(event).map_err(|e| ScaleError::Journal(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ScaleError::Journal(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| ScaleError::Journal(e.to_string()))?;
        Ok(())
    }

    /// Append, downgrading failures to a warning. A broken journal must
    /// not block a scaling action that already happened.
    pub fn append_best_effort(&self, event: &ScalingEvent) {
        if let Err(e) = self.append(event) {
            warn!(service = %event.service, error = %e, "scaling journal append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_structured_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaling.log");
        let journal = ScalingJournal::new(&path);

        journal
            .append(&ScalingEvent {
                service: "api".to_string(),
                direction: ScaleDirection::Up,
                from_replicas: 2,
                to_replicas: 3,
                load_ratio: 1.21,
                timestamp: 1_700_000_000_000,
            })
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let event: ScalingEvent = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(event.direction, ScaleDirection::Up);
        assert_eq!(event.to_replicas, 3);
    }
}
