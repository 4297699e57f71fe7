//! ServiceController — start/stop/restart for managed service processes.
//!
//! Start resolves port conflicts before spawning and records the PID in
//! the registry. Stop escalates from SIGTERM to SIGKILL and frees the
//! port as an independent fallback, always ending in `Stopped`. Restart
//! is stop → pause → start and bumps the restart counter only when the
//! subsequent start succeeds.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use fleet_registry::registry::epoch_millis;
use fleet_registry::{ServiceConfig, ServiceRegistry};

use crate::audit::{AuditLog, AuditRecord};
use crate::error::{ControlError, ControlResult};
use crate::process;

/// Controls the OS processes behind managed services.
#[derive(Clone)]
pub struct ServiceController {
    registry: ServiceRegistry,
    audit: AuditLog,
    /// Pause between stop and start during a restart.
    restart_pause: Duration,
    /// How long to wait for graceful exit before SIGKILL.
    stop_grace: Duration,
}

impl ServiceController {
    /// Create a controller over the given registry and audit journal.
    pub fn new(registry: ServiceRegistry, audit: AuditLog) -> Self {
        Self {
            registry,
            audit,
            restart_pause: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }

    /// Set the pause between stop and start during restarts.
    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    /// Set the graceful-termination wait before SIGKILL.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Start the service's process. Frees the configured port first if
    /// something is already bound to it.
    pub async fn start(&self, config: &ServiceConfig) -> ControlResult<u32> {
        let began = Instant::now();
        let outcome = self.start_inner(config).await;
        self.audit.append_best_effort(&AuditRecord {
            timestamp: epoch_millis(),
            service: config.name.clone(),
            operation: "start".to_string(),
            success: outcome.is_ok(),
            duration_ms: began.elapsed().as_millis() as u64,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });
        outcome
    }

    async fn start_inner(&self, config: &ServiceConfig) -> ControlResult<u32> {
        self.registry.register(&config.name, config.port)?;

        if process::port_in_use(config.port) {
            warn!(service = %config.name, port = config.port, "port already bound, freeing");
            process::free_port(config.port).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        self.registry.mark_starting(&config.name)?;

        if let Some(dir) = config.log_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)?;
        let log_err = log.try_clone()?;

        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&config.start_command)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn();

        match spawned {
            Ok(mut child) => {
                let Some(pid) = child.id() else {
                    self.registry.mark_stopped(&config.name)?;
                    return Err(ControlError::Spawn {
                        service: config.name.clone(),
                        reason: "process exited before a PID was observed".to_string(),
                    });
                };
                // Reap the child in the background so it never lingers
                // as a zombie after it exits.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                self.registry.mark_running(&config.name, pid)?;
                info!(service = %config.name, pid, port = config.port, "service started");
                Ok(pid)
            }
            Err(e) => {
                self.registry.mark_stopped(&config.name)?;
                Err(ControlError::Spawn {
                    service: config.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop the service's process. Always ends with the service marked
    /// `Stopped`, whatever the PID did.
    pub async fn stop(&self, config: &ServiceConfig) -> ControlResult<()> {
        let began = Instant::now();
        let outcome = self.stop_inner(config).await;
        self.audit.append_best_effort(&AuditRecord {
            timestamp: epoch_millis(),
            service: config.name.clone(),
            operation: "stop".to_string(),
            success: outcome.is_ok(),
            duration_ms: began.elapsed().as_millis() as u64,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });
        outcome
    }

    async fn stop_inner(&self, config: &ServiceConfig) -> ControlResult<()> {
        self.registry.register(&config.name, config.port)?;

        if let Some(pid) = self.registry.get(&config.name).and_then(|s| s.pid) {
            self.registry.update_state(
                &config.name,
                fleet_registry::ServiceUpdate {
                    status: Some(fleet_registry::ServiceStatus::Stopping),
                    ..Default::default()
                },
            )?;

            process::terminate(pid, false).await;
            if !process::wait_for_exit(pid, self.stop_grace).await {
                warn!(service = %config.name, pid, "graceful stop timed out, sending SIGKILL");
                process::terminate(pid, true).await;
                process::wait_for_exit(pid, Duration::from_secs(1)).await;
            }
        }

        // Independent fallback: free the port even if the PID was gone
        // or belonged to something else.
        process::free_port(config.port).await;

        self.registry.mark_stopped(&config.name)?;
        info!(service = %config.name, "service stopped");
        Ok(())
    }

    /// Restart: stop, pause, start. The restart counter moves only if
    /// the start succeeds; the attempt time is stamped either way.
    pub async fn restart(&self, config: &ServiceConfig) -> ControlResult<u32> {
        let began = Instant::now();
        self.registry.register(&config.name, config.port)?;
        self.registry.note_restart_attempt(&config.name)?;

        let outcome = async {
            self.stop(config).await?;
            tokio::time::sleep(self.restart_pause).await;
            let pid = self.start(config).await?;
            self.registry.increment_restart_count(&config.name)?;
            Ok(pid)
        }
        .await;

        self.audit.append_best_effort(&AuditRecord {
            timestamp: epoch_millis(),
            service: config.name.clone(),
            operation: "restart".to_string(),
            success: outcome.is_ok(),
            duration_ms: began.elapsed().as_millis() as u64,
            error: outcome.as_ref().err().map(|e: &ControlError| e.to_string()),
        });
        outcome
    }

    /// The registry this controller writes to.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_registry::ServiceStatus;

    fn free_local_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(dir: &std::path::Path, name: &str, command: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            port: free_local_port(),
            start_command: command.to_string(),
            log_file: dir.join(format!("{name}.log")),
            health_path: "/health".to_string(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn start_records_pid_and_marks_running() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::ephemeral();
        let controller = ServiceController::new(registry.clone(), AuditLog::disabled());
        let config = test_config(dir.path(), "api", "sleep 30");

        let pid = controller.start(&config).await.unwrap();

        let state = registry.get("api").unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.pid, Some(pid));

        controller.stop(&config).await.unwrap();
    }

    #[tokio::test]
    async fn stop_always_ends_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::ephemeral();
        let controller = ServiceController::new(registry.clone(), AuditLog::disabled())
            .with_stop_grace(Duration::from_secs(2));
        let config = test_config(dir.path(), "api", "sleep 30");

        controller.start(&config).await.unwrap();
        controller.stop(&config).await.unwrap();

        let state = registry.get("api").unwrap();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert_eq!(state.pid, None);
    }

    #[tokio::test]
    async fn stop_without_running_process_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::ephemeral();
        let controller = ServiceController::new(registry.clone(), AuditLog::disabled());
        let config = test_config(dir.path(), "api", "sleep 30");

        controller.stop(&config).await.unwrap();
        assert_eq!(registry.get("api").unwrap().status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn restart_increments_count_and_stamps_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::ephemeral();
        let controller = ServiceController::new(registry.clone(), AuditLog::disabled())
            .with_restart_pause(Duration::from_millis(10));
        let config = test_config(dir.path(), "api", "sleep 30");

        controller.start(&config).await.unwrap();
        let pid = controller.restart(&config).await.unwrap();

        let state = registry.get("api").unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.pid, Some(pid));
        assert_eq!(state.restart_count, 1);
        assert!(state.last_restart.is_some());

        controller.stop(&config).await.unwrap();
    }

    #[tokio::test]
    async fn operations_append_audit_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.log");
        let registry = ServiceRegistry::ephemeral();
        let controller =
            ServiceController::new(registry, AuditLog::new(&audit_path))
                .with_restart_pause(Duration::from_millis(10));
        let config = test_config(dir.path(), "api", "sleep 30");

        controller.start(&config).await.unwrap();
        controller.stop(&config).await.unwrap();

        let text = std::fs::read_to_string(&audit_path).unwrap();
        let records: Vec<AuditRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, "start");
        assert_eq!(records[1].operation, "stop");
        assert!(records.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn spawned_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::ephemeral();
        let controller = ServiceController::new(registry, AuditLog::disabled());
        let config = test_config(dir.path(), "echoer", "echo hello-from-service");

        controller.start(&config).await.unwrap();
        // Give the short-lived process a moment to write and exit.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let text = std::fs::read_to_string(&config.log_file).unwrap();
        assert!(text.contains("hello-from-service"));
    }
}
