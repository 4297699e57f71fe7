//! Health scoring — self-reported metrics to a 0–100 score.
//!
//! Four equally weighted sub-scores, each inverted so that higher is
//! better: CPU load, memory load, response time against a configurable
//! "poor" ceiling, and error rate against a configurable "poor" ceiling.

use serde::{Deserialize, Serialize};

/// Metrics an instance self-reports each interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceMetrics {
    /// CPU utilization percent, 0–100.
    pub cpu: f64,
    /// Memory utilization percent, 0–100.
    pub memory: f64,
    pub response_time_ms: f64,
    /// Error rate percent.
    pub error_rate: f64,
}

/// Normalization ceilings and status bands.
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    /// Response time scoring 0 at or above this.
    pub response_time_poor_ms: f64,
    /// Error rate scoring 0 at or above this.
    pub error_rate_poor: f64,
    pub healthy_threshold: f64,
    pub degraded_threshold: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            response_time_poor_ms: 1000.0,
            error_rate_poor: 10.0,
            healthy_threshold: 70.0,
            degraded_threshold: 40.0,
        }
    }
}

/// Routing status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Shutting down; receives no traffic but is still registered.
    Draining,
    /// Stopped reporting; swept out of the routable set.
    Offline,
}

/// Compute the 0–100 health score for a set of reported metrics.
pub fn compute_score(metrics: &InstanceMetrics, config: &ScoreConfig) -> f64 {
    let cpu = (100.0 - metrics.cpu).clamp(0.0, 100.0);
    let memory = (100.0 - metrics.memory).clamp(0.0, 100.0);
    let response_time =
        (100.0 * (1.0 - metrics.response_time_ms / config.response_time_poor_ms)).clamp(0.0, 100.0);
    let error_rate =
        (100.0 * (1.0 - metrics.error_rate / config.error_rate_poor)).clamp(0.0, 100.0);

    ((cpu + memory + response_time + error_rate) / 4.0).clamp(0.0, 100.0)
}

/// Map a score to its status band.
pub fn band(score: f64, config: &ScoreConfig) -> InstanceStatus {
    if score >= config.healthy_threshold {
        InstanceStatus::Healthy
    } else if score >= config.degraded_threshold {
        InstanceStatus::Degraded
    } else {
        InstanceStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_instance_scores_near_perfect() {
        let score = compute_score(
            &InstanceMetrics {
                cpu: 0.0,
                memory: 0.0,
                response_time_ms: 0.0,
                error_rate: 0.0,
            },
            &ScoreConfig::default(),
        );
        assert_eq!(score, 100.0);
    }

    #[test]
    fn loaded_instance_scores_unhealthy() {
        // cpu 90 -> 10, memory 85 -> 15, rt 900/1000 -> 10, er 8/10 -> 20.
        let config = ScoreConfig::default();
        let score = compute_score(
            &InstanceMetrics {
                cpu: 90.0,
                memory: 85.0,
                response_time_ms: 900.0,
                error_rate: 8.0,
            },
            &config,
        );
        assert!((score - 13.75).abs() < 1e-9);
        assert_eq!(band(score, &config), InstanceStatus::Unhealthy);
    }

    #[test]
    fn sub_scores_clamp_at_zero_beyond_the_ceiling() {
        let score = compute_score(
            &InstanceMetrics {
                cpu: 150.0,
                memory: 120.0,
                response_time_ms: 5000.0,
                error_rate: 90.0,
            },
            &ScoreConfig::default(),
        );
        assert_eq!(score, 0.0);
    }

    #[test]
    fn bands_honor_thresholds() {
        let config = ScoreConfig::default();
        assert_eq!(band(70.0, &config), InstanceStatus::Healthy);
        assert_eq!(band(69.9, &config), InstanceStatus::Degraded);
        assert_eq!(band(40.0, &config), InstanceStatus::Degraded);
        assert_eq!(band(39.9, &config), InstanceStatus::Unhealthy);
    }

    #[test]
    fn custom_ceilings_shift_the_score() {
        // With a 2000ms ceiling, 900ms scores 55 instead of 10.
        let config = ScoreConfig {
            response_time_poor_ms: 2000.0,
            ..ScoreConfig::default()
        };
        let score = compute_score(
            &InstanceMetrics {
                cpu: 0.0,
                memory: 0.0,
                response_time_ms: 900.0,
                error_rate: 0.0,
            },
            &config,
        );
        assert!((score - (100.0 + 100.0 + 55.0 + 100.0) / 4.0).abs() < 1e-9);
    }
}
