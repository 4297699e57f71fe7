//! ServiceRegistry — file-backed state map for managed services.
//!
//! All mutations go through named transition operations and are flushed
//! to disk immediately. The on-disk format is a pretty-printed JSON map
//! of `name → ServiceState`, written to a temp file in the same directory
//! and renamed into place so a crash mid-write never corrupts the file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{ServiceState, ServiceStatus, ServiceUpdate};

/// Counts of services by status, for operator summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    pub total: usize,
    pub running: usize,
    pub unhealthy: usize,
    pub stopped: usize,
    pub starting: usize,
    pub stopping: usize,
    pub unknown: usize,
}

/// Thread-safe service registry with file persistence.
#[derive(Clone)]
pub struct ServiceRegistry {
    services: Arc<Mutex<HashMap<String, ServiceState>>>,
    /// Persistence path; `None` for an ephemeral (test) registry.
    path: Option<PathBuf>,
}

impl ServiceRegistry {
    /// Open a registry persisted at the given path.
    ///
    /// A missing or corrupt file starts the registry empty; the failure
    /// is logged but never fatal.
    pub fn open(path: &Path) -> Self {
        let services = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, ServiceState>>(&bytes) {
                Ok(map) => {
                    info!(?path, services = map.len(), "registry loaded");
                    map
                }
                Err(e) => {
                    warn!(?path, error = %e, "corrupt registry file, starting empty");
                    HashMap::new()
                }
            },
            Err(e) => {
                debug!(?path, error = %e, "no registry file, starting empty");
                HashMap::new()
            }
        };
        Self {
            services: Arc::new(Mutex::new(services)),
            path: Some(path.to_path_buf()),
        }
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn ephemeral() -> Self {
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            path: None,
        }
    }

    /// Register a service. Idempotent — re-registering a known name is a
    /// no-op that preserves existing state.
    pub fn register(&self, name: &str, port: u16) -> RegistryResult<()> {
        let mut services = self.lock();
        if services.contains_key(name) {
            debug!(service = %name, "already registered");
            return Ok(());
        }
        services.insert(name.to_string(), ServiceState::new(name, port));
        info!(service = %name, port, "service registered");
        self.persist(&services)
    }

    /// Merge a partial update into a service's state.
    pub fn update_state(&self, name: &str, update: ServiceUpdate) -> RegistryResult<()> {
        let mut services = self.lock();
        let state = services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
        if let Some(status) = update.status {
            state.status = status;
        }
        if let Some(pid) = update.pid {
            state.pid = Some(pid);
        }
        if let Some(t) = update.uptime_started_at {
            state.uptime_started_at = Some(t);
        }
        if let Some(t) = update.last_health_check {
            state.last_health_check = Some(t);
        }
        if let Some(t) = update.last_restart {
            state.last_restart = Some(t);
        }
        self.persist(&services)
    }

    /// Mark a service running with the given PID. Starts a fresh uptime
    /// window if the service was not already running.
    pub fn mark_running(&self, name: &str, pid: u32) -> RegistryResult<()> {
        self.transition(name, |state| {
            if state.status != ServiceStatus::Running {
                state.uptime_started_at = Some(epoch_millis());
            }
            state.status = ServiceStatus::Running;
            state.pid = Some(pid);
        })
    }

    /// Mark a service stopped, clearing its PID and uptime window.
    pub fn mark_stopped(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            state.status = ServiceStatus::Stopped;
            state.pid = None;
            state.uptime_started_at = None;
        })
    }

    /// Mark a service starting.
    pub fn mark_starting(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            state.status = ServiceStatus::Starting;
            state.uptime_started_at = None;
        })
    }

    /// Record a failed health check: increments the consecutive-failure
    /// counter and moves the service to `Unhealthy`.
    pub fn mark_unhealthy(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            state.consecutive_failures += 1;
            state.status = ServiceStatus::Unhealthy;
            state.uptime_started_at = None;
            state.last_health_check = Some(epoch_millis());
        })
    }

    /// Record a passing health check: resets the consecutive-failure
    /// counter and moves the service to `Running`.
    pub fn mark_healthy(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            if state.status != ServiceStatus::Running {
                state.uptime_started_at = Some(epoch_millis());
            }
            state.consecutive_failures = 0;
            state.status = ServiceStatus::Running;
            state.last_health_check = Some(epoch_millis());
        })
    }

    /// Increment the restart counter after a successful restart.
    pub fn increment_restart_count(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            state.restart_count += 1;
        })
    }

    /// Reset the restart counter (explicit operator or stability-sweep action).
    pub fn reset_restart_count(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            state.restart_count = 0;
        })
    }

    /// Stamp the time of a restart attempt, successful or not.
    pub fn note_restart_attempt(&self, name: &str) -> RegistryResult<()> {
        self.transition(name, |state| {
            state.last_restart = Some(epoch_millis());
        })
    }

    /// Whether the service is still under its restart budget.
    pub fn can_restart(&self, name: &str, max_attempts: u32) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|s| s.restart_count < max_attempts)
    }

    /// Whether consecutive failures have reached the escalation threshold.
    pub fn needs_escalation(&self, name: &str, threshold: u32) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|s| s.consecutive_failures >= threshold)
    }

    /// Get a snapshot of a service's state.
    pub fn get(&self, name: &str) -> Option<ServiceState> {
        self.lock().get(name).cloned()
    }

    /// Snapshot of all service states.
    pub fn list(&self) -> Vec<ServiceState> {
        self.lock().values().cloned().collect()
    }

    /// Per-status counts for operator summaries.
    pub fn summary(&self) -> RegistrySummary {
        let services = self.lock();
        let mut summary = RegistrySummary {
            total: services.len(),
            ..Default::default()
        };
        for state in services.values() {
            match state.status {
                ServiceStatus::Running => summary.running += 1,
                ServiceStatus::Unhealthy => summary.unhealthy += 1,
                ServiceStatus::Stopped => summary.stopped += 1,
                ServiceStatus::Starting => summary.starting += 1,
                ServiceStatus::Stopping => summary.stopping += 1,
                ServiceStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    /// Apply a closure to a known service's state and persist.
    fn transition(
        &self,
        name: &str,
        f: impl FnOnce(&mut ServiceState),
    ) -> RegistryResult<()> {
        let mut services = self.lock();
        let state = services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
        f(state);
        self.persist(&services)
    }

    /// Flush the full map to disk atomically (temp file + rename).
    fn persist(&self, services: &HashMap<String, ServiceState>) -> RegistryResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        // BTreeMap for a stable, diff-friendly on-disk ordering.
        let ordered: BTreeMap<&String, &ServiceState> = services.iter().collect();
        let bytes = serde_json::to_vec_pretty(&ordered)
            .map_err(|e| RegistryError::Serialize(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| RegistryError::Persist(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| RegistryError::Persist(e.to_string()))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceState>> {
        // A poisoned lock only happens if a holder panicked; the map is
        // still structurally valid, so recover the guard.
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Current time as Unix milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
