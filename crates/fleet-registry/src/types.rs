//! Domain types for the fleet service registry.
//!
//! `ServiceState` is the persisted lifecycle record for a managed service;
//! `HealthCheckResult` is the ephemeral outcome of a single probe, consumed
//! by the registry and recovery logic but never stored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Unhealthy,
}

/// Persisted lifecycle state of a single managed service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceState {
    pub name: String,
    pub port: u16,
    pub status: ServiceStatus,
    /// OS process ID while the service is running.
    pub pid: Option<u32>,
    /// Unix timestamp (ms) when the current uninterrupted running window began.
    pub uptime_started_at: Option<u64>,
    /// Restarts performed since the last explicit reset.
    pub restart_count: u32,
    /// Consecutive failed health checks; reset to zero by a healthy mark.
    pub consecutive_failures: u32,
    /// Unix timestamp (ms) of the most recent health check.
    pub last_health_check: Option<u64>,
    /// Unix timestamp (ms) of the most recent restart attempt.
    pub last_restart: Option<u64>,
}

impl ServiceState {
    /// Fresh state for a newly registered service.
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
            status: ServiceStatus::Unknown,
            pid: None,
            uptime_started_at: None,
            restart_count: 0,
            consecutive_failures: 0,
            last_health_check: None,
            last_restart: None,
        }
    }
}

/// Result of a single health check. Ephemeral — produced per poll and
/// consumed immediately, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    pub service: String,
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    /// Raw error text for transport-level failures, retained for
    /// downstream classification.
    pub error: Option<String>,
    /// Unix timestamp (ms).
    pub timestamp: u64,
}

/// Static configuration for a managed service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub port: u16,
    /// Shell command used to start the service.
    pub start_command: String,
    /// File receiving the spawned process's stdout and stderr.
    pub log_file: PathBuf,
    /// Health endpoint path probed by the monitor (e.g. "/health").
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Disabled services are skipped by the monitor and recovery.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Partial update merged into a service state. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub status: Option<ServiceStatus>,
    pub pid: Option<u32>,
    pub uptime_started_at: Option<u64>,
    pub last_health_check: Option<u64>,
    pub last_restart: Option<u64>,
}
