//! Host metrics sampling.
//!
//! CPU utilization is the 1-minute load average normalized by core
//! count; memory utilization comes from MemTotal/MemAvailable in
//! /proc/meminfo. Both are percentages in [0, 100+] (load can exceed
//! the core count).

use crate::error::{ScaleError, ScaleResult};

/// One sample of host utilization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemMetrics {
    /// CPU utilization percent.
    pub cpu_percent: f64,
    /// Memory utilization percent.
    pub memory_percent: f64,
}

/// The seam to wherever utilization numbers come from.
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> ScaleResult<SystemMetrics>;
}

/// Metrics source backed by the /proc filesystem.
pub struct ProcMetrics;

impl MetricsSource for ProcMetrics {
    fn sample(&self) -> ScaleResult<SystemMetrics> {
        let loadavg = std::fs::read_to_string("/proc/loadavg")
            .map_err(|e| ScaleError::Metrics(format!("read /proc/loadavg: {e}")))?;
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| ScaleError::Metrics(format!("read /proc/meminfo: {e}")))?;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(SystemMetrics {
            cpu_percent: cpu_percent_from_loadavg(&loadavg, cores)?,
            memory_percent: memory_percent_from_meminfo(&meminfo)?,
        })
    }
}

fn cpu_percent_from_loadavg(loadavg: &str, cores: usize) -> ScaleResult<f64> {
    let load_1m: f64 = loadavg
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ScaleError::Metrics(format!("malformed loadavg: {loadavg:?}")))?;
    Ok(100.0 * load_1m / cores as f64)
}

fn memory_percent_from_meminfo(meminfo: &str) -> ScaleResult<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")
        .filter(|v| *v > 0.0)
        .ok_or_else(|| ScaleError::Metrics("MemTotal missing from /proc/meminfo".to_string()))?;
    let available = field("MemAvailable:")
        .ok_or_else(|| ScaleError::Metrics("MemAvailable missing from /proc/meminfo".to_string()))?;
    Ok(100.0 * (total - available) / total)
}
