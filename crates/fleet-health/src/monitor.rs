//! Health monitor — recurring sweep over all managed services.
//!
//! One background task checks every enabled service in turn each tick,
//! updates the registry per result, and invokes the unhealthy callback
//! when a probe fails. Start and stop are idempotent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_registry::{HealthCheckResult, ServiceConfig, ServiceRegistry};

use crate::checker::probe;

/// Callback invoked when a service probe comes back unhealthy.
///
/// Auto-recovery registers here to drive restarts.
pub type UnhealthyCallback =
    Arc<dyn Fn(ServiceConfig, HealthCheckResult) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Handle to the running sweep task.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Periodically checks every enabled service's health endpoint.
pub struct HealthMonitor {
    registry: ServiceRegistry,
    services: Vec<ServiceConfig>,
    interval: Duration,
    timeout: Duration,
    on_unhealthy: Option<UnhealthyCallback>,
    slot: Arc<Mutex<Option<MonitorSlot>>>,
}

impl HealthMonitor {
    /// Create a monitor over the given services.
    pub fn new(registry: ServiceRegistry, services: Vec<ServiceConfig>) -> Self {
        Self {
            registry,
            services,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            on_unhealthy: None,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the callback invoked on each unhealthy result.
    pub fn with_callback(mut self, callback: UnhealthyCallback) -> Self {
        self.on_unhealthy = Some(callback);
        self
    }

    /// Start monitoring. Calling start while already running is a no-op
    /// warning, not an error. The first sweep runs immediately.
    pub fn start(&self) {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            warn!("health monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let services = self.services.clone();
        let interval = self.interval;
        let timeout = self.timeout;
        let callback = self.on_unhealthy.clone();

        let handle = tokio::spawn(async move {
            // Immediate sweep, then the recurring ticker.
            sweep(&registry, &services, timeout, callback.as_ref()).await;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        sweep(&registry, &services, timeout, callback.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("health monitor loop exiting");
                        break;
                    }
                }
            }
        });

        *slot = Some(MonitorSlot {
            handle,
            shutdown_tx,
        });
        info!(interval_secs = interval.as_secs(), services = self.services.len(), "health monitor started");
    }

    /// Stop monitoring. Idempotent.
    pub fn stop(&self) {
        let mut slot = self.lock_slot();
        match slot.take() {
            Some(running) => {
                let _ = running.shutdown_tx.send(true);
                running.handle.abort();
                info!("health monitor stopped");
            }
            None => debug!("health monitor already stopped"),
        }
    }

    /// Whether the sweep task is running.
    pub fn is_running(&self) -> bool {
        self.lock_slot().is_some()
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<MonitorSlot>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One sweep: check each enabled service in turn and update the registry.
///
/// Disabled services are skipped entirely. The callback fires only on
/// unhealthy results.
pub async fn sweep(
    registry: &ServiceRegistry,
    services: &[ServiceConfig],
    timeout: Duration,
    callback: Option<&UnhealthyCallback>,
) {
    for config in services.iter().filter(|s| s.enabled) {
        if let Err(e) = registry.register(&config.name, config.port) {
            warn!(service = %config.name, error = %e, "could not register service");
            continue;
        }

        let address = format!("127.0.0.1:{}", config.port);
        let result = probe(&config.name, &address, &config.health_path, timeout).await;

        let marked = if result.healthy {
            registry.mark_healthy(&config.name)
        } else {
            registry.mark_unhealthy(&config.name)
        };
        if let Err(e) = marked {
            warn!(service = %config.name, error = %e, "could not record health result");
        }

        if !result.healthy && let Some(cb) = callback {
            cb(config.clone(), result).await;
        }
    }
}
