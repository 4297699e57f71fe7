//! RecoveryManager — the per-service recovery state machine.
//!
//! Each service moves idle → recovering → idle; overlapping recoveries
//! for the same service are skipped, as are attempts inside the cooldown
//! window. When the restart budget is exhausted and the escalation
//! threshold is met, one escalation record is emitted and recovery stops
//! touching the service until it stabilizes again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_registry::registry::epoch_millis;
use fleet_registry::{HealthCheckResult, ServiceConfig, ServiceRegistry, ServiceStatus};

use crate::classify::{classify, ErrorCategory};
use crate::error::RecoveryResult;
use crate::escalation::{EscalationLog, EscalationRecord};

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Callback invoked once per escalation, after the journal append.
pub type EscalationCallback = Arc<dyn Fn(EscalationRecord) -> BoxFuture<()> + Send + Sync>;

/// The seam to the service controller.
///
/// Implementations must stamp and count the restart in the registry on
/// success, as `ServiceController::restart` does.
pub trait Restarter: Send + Sync {
    /// Stop, pause, and start the service's process.
    fn restart(&self, config: &ServiceConfig) -> BoxFuture<anyhow::Result<u32>>;
    /// Kill whatever currently holds the given TCP port.
    fn free_port(&self, port: u16) -> BoxFuture<()>;
}

impl Restarter for fleet_control::ServiceController {
    fn restart(&self, config: &ServiceConfig) -> BoxFuture<anyhow::Result<u32>> {
        let controller = self.clone();
        let config = config.clone();
        Box::pin(async move { Ok(controller.restart(&config).await?) })
    }

    fn free_port(&self, port: u16) -> BoxFuture<()> {
        Box::pin(fleet_control::process::free_port(port))
    }
}

/// Tuning for the recovery state machine.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Restart budget before escalation is considered.
    pub max_attempts: u32,
    /// Minimum spacing between restart attempts per service.
    pub cooldown: Duration,
    /// Consecutive failures required before escalating.
    pub escalation_threshold: u32,
    /// Pause after a successful restart to let the service stabilize.
    pub stabilize_delay: Duration,
    /// Extra wait before restarting a service that timed out.
    pub timeout_extra_wait: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(60),
            escalation_threshold: 5,
            stabilize_delay: Duration::from_secs(5),
            timeout_extra_wait: Duration::from_secs(5),
        }
    }
}

/// What a single unhealthy signal resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A recovery for this service is already in flight.
    AlreadyInFlight,
    /// Within the cooldown window since the last attempt.
    InCooldown,
    /// Budget exhausted and threshold met: escalation record emitted.
    Escalated,
    /// Budget exhausted; escalation already emitted or threshold not met.
    AttemptsExhausted,
    /// Restart succeeded.
    Restarted,
    /// Restart was attempted and failed.
    RestartFailed(String),
}

/// Removes the service from the in-flight set on every exit path.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.name);
    }
}

/// Drives restarts and escalation for unhealthy services.
pub struct RecoveryManager {
    registry: ServiceRegistry,
    restarter: Arc<dyn Restarter>,
    config: RecoveryConfig,
    escalation_log: EscalationLog,
    on_escalation: Option<EscalationCallback>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Services already escalated; cleared when they stabilize.
    escalated: Arc<Mutex<HashSet<String>>>,
}

impl RecoveryManager {
    /// Create a recovery manager over the given collaborators.
    pub fn new(
        registry: ServiceRegistry,
        restarter: Arc<dyn Restarter>,
        config: RecoveryConfig,
        escalation_log: EscalationLog,
    ) -> Self {
        Self {
            registry,
            restarter,
            config,
            escalation_log,
            on_escalation: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            escalated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Set the notification callback fired on each escalation.
    pub fn with_escalation_callback(mut self, callback: EscalationCallback) -> Self {
        self.on_escalation = Some(callback);
        self
    }

    /// React to one unhealthy signal for a service.
    pub async fn handle_unhealthy(
        &self,
        config: &ServiceConfig,
        result: &HealthCheckResult,
    ) -> RecoveryResult<RecoveryOutcome> {
        let name = config.name.clone();

        // Overlapping restarts for one service are never allowed.
        if !lock(&self.in_flight).insert(name.clone()) {
            debug!(service = %name, "recovery already in flight, skipping");
            return Ok(RecoveryOutcome::AlreadyInFlight);
        }
        let _guard = InFlightGuard {
            set: self.in_flight.clone(),
            name: name.clone(),
        };

        // Cooldown since the last attempt, successful or not.
        if let Some(last) = self.registry.get(&name).and_then(|s| s.last_restart) {
            let since = epoch_millis().saturating_sub(last);
            if since < self.config.cooldown.as_millis() as u64 {
                debug!(service = %name, since_ms = since, "within cooldown, skipping");
                return Ok(RecoveryOutcome::InCooldown);
            }
        }

        // Budget exhausted: consider escalation instead of restarting.
        if !self.registry.can_restart(&name, self.config.max_attempts) {
            if self
                .registry
                .needs_escalation(&name, self.config.escalation_threshold)
                && lock(&self.escalated).insert(name.clone())
            {
                self.escalate(config, result).await;
                return Ok(RecoveryOutcome::Escalated);
            }
            debug!(service = %name, "restart budget exhausted");
            return Ok(RecoveryOutcome::AttemptsExhausted);
        }

        // Remediate the cause before the standard restart path.
        let category = result.error.as_deref().map(classify).unwrap_or(ErrorCategory::Unknown);
        match category {
            ErrorCategory::PortConflict => {
                info!(service = %name, port = config.port, "port conflict, freeing port before restart");
                self.restarter.free_port(config.port).await;
            }
            ErrorCategory::Timeout => {
                debug!(service = %name, "timeout failure, waiting before restart");
                tokio::time::sleep(self.config.timeout_extra_wait).await;
            }
            _ => {}
        }

        let attempt = self.restarter.restart(config).await;
        // The attempt time gates the next cooldown window whatever happened.
        self.registry.note_restart_attempt(&name)?;

        match attempt {
            Ok(pid) => {
                info!(service = %name, pid, ?category, "service restarted");
                tokio::time::sleep(self.config.stabilize_delay).await;
                Ok(RecoveryOutcome::Restarted)
            }
            Err(e) => {
                warn!(service = %name, error = %e, "restart failed");
                Ok(RecoveryOutcome::RestartFailed(e.to_string()))
            }
        }
    }

    /// Emit the escalation record and fire the notification callback.
    async fn escalate(&self, config: &ServiceConfig, result: &HealthCheckResult) {
        let state = self.registry.get(&config.name);
        let record = EscalationRecord {
            service: config.name.clone(),
            consecutive_failures: state.as_ref().map(|s| s.consecutive_failures).unwrap_or(0),
            restart_count: state.as_ref().map(|s| s.restart_count).unwrap_or(0),
            last_error: result.error.clone(),
            timestamp: epoch_millis(),
        };

        warn!(
            service = %record.service,
            consecutive_failures = record.consecutive_failures,
            restart_count = record.restart_count,
            "recovery exhausted, escalating to operator"
        );
        self.escalation_log.append_best_effort(&record);

        if let Some(ref cb) = self.on_escalation {
            cb(record).await;
        }
    }

    /// Reset restart counters for services that have stayed running for
    /// at least twice the cooldown period uninterrupted. Returns the
    /// names reset.
    pub fn sweep_stable(&self) -> RecoveryResult<Vec<String>> {
        let stable_after = 2 * self.config.cooldown.as_millis() as u64;
        let now = epoch_millis();
        let mut reset = Vec::new();

        for state in self.registry.list() {
            if state.status != ServiceStatus::Running || state.restart_count == 0 {
                continue;
            }
            let Some(since) = state.uptime_started_at else {
                continue;
            };
            if now.saturating_sub(since) >= stable_after {
                self.registry.reset_restart_count(&state.name)?;
                lock(&self.escalated).remove(&state.name);
                info!(service = %state.name, uptime_ms = now - since, "stable service, restart counter reset");
                reset.push(state.name);
            }
        }
        Ok(reset)
    }

    /// Run the stability sweep on an interval until shutdown.
    pub async fn run_stability_sweep(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "stability sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_stable() {
                        warn!(error = %e, "stability sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("stability sweep shutting down");
                    break;
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
