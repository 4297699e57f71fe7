//! Daemon configuration.
//!
//! One TOML file describes the managed services and the tuning for each
//! subsystem. Every tuning field has a default, so a minimal config is
//! just `[[service]]` entries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use fleet_registry::ServiceConfig;

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Identity of this node in the shared routing/locking view.
    /// Generated when absent.
    pub instance_id: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub scaling: ScalingSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub escalation_threshold: u32,
    pub stabilize_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown_secs: 60,
            escalation_threshold: 5,
            stabilize_secs: 5,
        }
    }
}

impl RecoverySection {
    pub fn to_config(&self) -> fleet_recovery::RecoveryConfig {
        fleet_recovery::RecoveryConfig {
            max_attempts: self.max_attempts,
            cooldown: Duration::from_secs(self.cooldown_secs),
            escalation_threshold: self.escalation_threshold,
            stabilize_delay: Duration::from_secs(self.stabilize_secs),
            ..fleet_recovery::RecoveryConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub response_time_poor_ms: f64,
    pub error_rate_poor: f64,
    pub healthy_threshold: f64,
    pub degraded_threshold: f64,
    pub breaker_threshold: u32,
    pub grace_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            response_time_poor_ms: 1000.0,
            error_rate_poor: 10.0,
            healthy_threshold: 70.0,
            degraded_threshold: 40.0,
            breaker_threshold: 3,
            grace_secs: 30,
            check_interval_secs: 10,
        }
    }
}

impl RouterSection {
    pub fn to_config(&self) -> fleet_router::RouterConfig {
        fleet_router::RouterConfig {
            score: fleet_router::ScoreConfig {
                response_time_poor_ms: self.response_time_poor_ms,
                error_rate_poor: self.error_rate_poor,
                healthy_threshold: self.healthy_threshold,
                degraded_threshold: self.degraded_threshold,
            },
            breaker_threshold: self.breaker_threshold,
            grace_period: Duration::from_secs(self.grace_secs),
            check_interval: Duration::from_secs(self.check_interval_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    pub enabled: bool,
    /// Service the scaler manages.
    pub service: String,
    /// Command template for scaling, with `{service}` and `{replicas}`
    /// placeholders.
    pub scale_command: String,
    /// Command template printing the current replica count.
    pub count_command: String,
    pub target_cpu: f64,
    pub target_memory: f64,
    pub target_rps_per_instance: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_instances: u32,
    pub max_instances: u32,
    pub cooldown_secs: u64,
    pub interval_secs: u64,
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            service: String::new(),
            scale_command: String::new(),
            count_command: String::new(),
            target_cpu: 70.0,
            target_memory: 75.0,
            target_rps_per_instance: 100.0,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            min_instances: 1,
            max_instances: 10,
            cooldown_secs: 300,
            interval_secs: 30,
        }
    }
}

impl ScalingSection {
    pub fn to_config(&self) -> fleet_scale::ScalerConfig {
        fleet_scale::ScalerConfig {
            service: self.service.clone(),
            target_cpu: self.target_cpu,
            target_memory: self.target_memory,
            target_rps_per_instance: self.target_rps_per_instance,
            scale_up_threshold: self.scale_up_threshold,
            scale_down_threshold: self.scale_down_threshold,
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            cooldown: Duration::from_secs(self.cooldown_secs),
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub drain_timeout_secs: u64,
    pub grace_secs: u64,
    pub stage_timeout_secs: u64,
    pub overall_timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            grace_secs: 5,
            stage_timeout_secs: 10,
            overall_timeout_secs: 60,
        }
    }
}

impl ShutdownSection {
    pub fn to_config(&self) -> fleet_shutdown::ShutdownConfig {
        fleet_shutdown::ShutdownConfig {
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            grace_period: Duration::from_secs(self.grace_secs),
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            overall_timeout: Duration::from_secs(self.overall_timeout_secs),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        Ok(config)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet")
}
