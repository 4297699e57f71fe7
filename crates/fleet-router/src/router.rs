//! Health-aware router over the shared store.
//!
//! Instances self-report metrics; each report is scored, banded, run
//! through the circuit breaker, and stored as one JSON record under
//! `instance:{id}`. Selection is a weighted random draw over the
//! routable set. A staleness sweep marks silent instances offline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleet_store::SharedStore;

use crate::error::{RouterError, RouterResult};
use crate::score::{band, compute_score, InstanceMetrics, InstanceStatus, ScoreConfig};

/// Stored routing state for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: String,
    pub address: String,
    pub status: InstanceStatus,
    pub score: f64,
    /// Relative probability of receiving the next request.
    pub weight: f64,
    pub consecutive_failures: u32,
    pub breaker_open: bool,
    /// Unix timestamp (ms) when the instance last recovered from
    /// failure; starts the weight grace period.
    pub recovered_at: Option<u64>,
    /// Unix timestamp (ms) of the last report.
    pub updated_at: u64,
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub score: ScoreConfig,
    /// Consecutive unhealthy reports that open the breaker.
    pub breaker_threshold: u32,
    /// Window over which a recovered instance's weight ramps back up.
    pub grace_period: Duration,
    /// Expected reporting interval; records older than twice this are
    /// swept offline.
    pub check_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            score: ScoreConfig::default(),
            breaker_threshold: 3,
            grace_period: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Routes requests to the healthiest available instances.
#[derive(Clone)]
pub struct HealthRouter {
    store: SharedStore,
    config: RouterConfig,
}

impl HealthRouter {
    pub fn new(store: SharedStore, config: RouterConfig) -> Self {
        Self { store, config }
    }

    /// Ingest one metrics report and return the updated record.
    pub fn report(
        &self,
        id: &str,
        address: &str,
        metrics: &InstanceMetrics,
    ) -> RouterResult<InstanceRecord> {
        let now = epoch_millis();
        let previous = self.get(id)?;

        let score = compute_score(metrics, &self.config.score);
        let status = band(score, &self.config.score);

        let mut failures = previous.as_ref().map(|r| r.consecutive_failures).unwrap_or(0);
        let mut breaker_open = previous.as_ref().map(|r| r.breaker_open).unwrap_or(false);
        let mut recovered_at = previous.as_ref().and_then(|r| r.recovered_at);

        if status == InstanceStatus::Unhealthy {
            failures += 1;
            if !breaker_open && failures >= self.config.breaker_threshold {
                breaker_open = true;
                warn!(instance = %id, failures, "circuit breaker opened");
            }
        } else {
            if failures > 0 {
                recovered_at = Some(now);
            }
            failures = 0;
            // The breaker only closes on a fully healthy score.
            if breaker_open && score >= self.config.score.healthy_threshold {
                breaker_open = false;
                recovered_at = Some(now);
                info!(instance = %id, score, "circuit breaker closed");
            }
        }

        let weight = if breaker_open {
            0.0
        } else {
            score * grace_factor(recovered_at, now, self.config.grace_period)
        };

        let record = InstanceRecord {
            id: id.to_string(),
            address: address.to_string(),
            status,
            score,
            weight,
            consecutive_failures: failures,
            breaker_open,
            recovered_at,
            updated_at: now,
        };
        self.put(&record)?;
        debug!(instance = %id, score, weight, ?status, "report ingested");
        Ok(record)
    }

    /// Pick an instance by weighted random draw over all records with
    /// weight > 0 that are not offline or draining.
    pub fn select(&self) -> RouterResult<InstanceRecord> {
        let candidates: Vec<InstanceRecord> = self
            .list()?
            .into_iter()
            .filter(|r| {
                r.weight > 0.0
                    && r.status != InstanceStatus::Offline
                    && r.status != InstanceStatus::Draining
            })
            .collect();

        let total: f64 = candidates.iter().map(|r| r.weight).sum();
        if candidates.is_empty() || total <= 0.0 {
            return Err(RouterError::NoInstanceAvailable);
        }
        let roll = rand::thread_rng().gen_range(0.0..total);
        Ok(pick_weighted(candidates, roll))
    }

    /// Mark silent instances offline. Returns the ids swept.
    pub fn sweep_stale(&self) -> RouterResult<Vec<String>> {
        let cutoff = 2 * self.config.check_interval.as_millis() as u64;
        let now = epoch_millis();
        let mut swept = Vec::new();

        for mut record in self.list()? {
            if record.status == InstanceStatus::Offline {
                continue;
            }
            if now.saturating_sub(record.updated_at) > cutoff {
                record.status = InstanceStatus::Offline;
                record.weight = 0.0;
                self.put(&record)?;
                warn!(instance = %record.id, "instance stale, marked offline");
                swept.push(record.id);
            }
        }
        Ok(swept)
    }

    /// Stop routing to an instance while leaving it registered.
    pub fn mark_draining(&self, id: &str) -> RouterResult<()> {
        let mut record = self.get(id)?.ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        record.status = InstanceStatus::Draining;
        record.weight = 0.0;
        self.put(&record)?;
        info!(instance = %id, "instance draining");
        Ok(())
    }

    /// Remove an instance from the routing view entirely.
    pub fn deregister(&self, id: &str) -> RouterResult<bool> {
        let removed = self.store.delete(&storage_key(id))?;
        if removed {
            info!(instance = %id, "instance deregistered");
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> RouterResult<Option<InstanceRecord>> {
        match self.store.get(&storage_key(id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// All registered instances, routable or not.
    pub fn list(&self) -> RouterResult<Vec<InstanceRecord>> {
        self.store
            .list_prefix(INSTANCE_PREFIX)?
            .into_iter()
            .map(|(_, json)| serde_json::from_str(&json).map_err(RouterError::from))
            .collect()
    }

    /// Run the staleness sweep on the check interval until shutdown.
    pub async fn run_sweep(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.config.check_interval;
        info!(interval_secs = interval.as_secs(), "router staleness sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_stale() {
                        warn!(error = %e, "staleness sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("router staleness sweep shutting down");
                    break;
                }
            }
        }
    }

    fn put(&self, record: &InstanceRecord) -> RouterResult<()> {
        let json = serde_json::to_string(record)?;
        self.store.set(&storage_key(&record.id), &json, None)?;
        Ok(())
    }
}

/// Linear weight ramp over the recovery grace period.
fn grace_factor(recovered_at: Option<u64>, now: u64, grace: Duration) -> f64 {
    let Some(recovered) = recovered_at else {
        return 1.0;
    };
    let grace_ms = grace.as_millis() as f64;
    if grace_ms <= 0.0 {
        return 1.0;
    }
    let elapsed = now.saturating_sub(recovered) as f64;
    (elapsed / grace_ms).clamp(0.0, 1.0)
}

/// Walk the candidates subtracting weights until the roll lands.
/// `roll` must be in `[0, total_weight)`.
fn pick_weighted(candidates: Vec<InstanceRecord>, mut roll: f64) -> InstanceRecord {
    let last = candidates.len() - 1;
    for (i, record) in candidates.into_iter().enumerate() {
        if roll < record.weight || i == last {
            return record;
        }
        roll -= record.weight;
    }
    unreachable!("candidates is non-empty")
}

const INSTANCE_PREFIX: &str = "instance:";

fn storage_key(id: &str) -> String {
    format!("{INSTANCE_PREFIX}{id}")
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> HealthRouter {
        HealthRouter::new(SharedStore::open_in_memory().unwrap(), RouterConfig::default())
    }

    fn healthy_metrics() -> InstanceMetrics {
        InstanceMetrics {
            cpu: 10.0,
            memory: 20.0,
            response_time_ms: 50.0,
            error_rate: 0.0,
        }
    }

    fn failing_metrics() -> InstanceMetrics {
        InstanceMetrics {
            cpu: 90.0,
            memory: 85.0,
            response_time_ms: 900.0,
            error_rate: 8.0,
        }
    }

    #[test]
    fn healthy_report_is_routable() {
        let router = router();
        let record = router.report("i-1", "10.0.0.1:3000", &healthy_metrics()).unwrap();

        assert_eq!(record.status, InstanceStatus::Healthy);
        assert!(record.score >= 70.0);
        assert_eq!(record.weight, record.score);
        assert_eq!(router.select().unwrap().id, "i-1");
    }

    #[test]
    fn breaker_opens_after_threshold_and_forces_zero_weight() {
        let router = router();

        // Two failures: unhealthy but breaker still closed.
        for _ in 0..2 {
            let record = router.report("i-1", "a", &failing_metrics()).unwrap();
            assert_eq!(record.status, InstanceStatus::Unhealthy);
            assert!(!record.breaker_open);
        }

        // Third consecutive failure opens the breaker.
        let record = router.report("i-1", "a", &failing_metrics()).unwrap();
        assert!(record.breaker_open);
        assert_eq!(record.weight, 0.0);

        // Improved but not healthy metrics: weight stays forced to 0.
        let improved = InstanceMetrics {
            cpu: 50.0,
            memory: 50.0,
            response_time_ms: 300.0,
            error_rate: 2.0,
        };
        let record = router.report("i-1", "a", &improved).unwrap();
        assert!(record.score > 40.0);
        assert!(record.breaker_open);
        assert_eq!(record.weight, 0.0);

        assert!(matches!(router.select(), Err(RouterError::NoInstanceAvailable)));
    }

    #[test]
    fn breaker_closes_only_on_healthy_score() {
        let router = router();
        for _ in 0..3 {
            router.report("i-1", "a", &failing_metrics()).unwrap();
        }
        assert!(router.get("i-1").unwrap().unwrap().breaker_open);

        let record = router.report("i-1", "a", &healthy_metrics()).unwrap();
        assert!(!record.breaker_open);
        assert!(record.recovered_at.is_some());
    }

    #[test]
    fn recovered_instance_weight_ramps_through_grace_period() {
        let router = HealthRouter::new(
            SharedStore::open_in_memory().unwrap(),
            RouterConfig {
                grace_period: Duration::from_secs(30),
                ..RouterConfig::default()
            },
        );

        router.report("i-1", "a", &failing_metrics()).unwrap();
        let record = router.report("i-1", "a", &healthy_metrics()).unwrap();

        // Just recovered: weight scaled down to near zero, ramping back
        // as the grace period elapses.
        assert!(record.recovered_at.is_some());
        assert!(record.score >= 70.0);
        assert!(record.weight < 1.0);
        assert!(!record.breaker_open);
    }

    #[test]
    fn grace_factor_ramps_linearly() {
        let grace = Duration::from_secs(30);
        assert_eq!(grace_factor(None, 1_000_000, grace), 1.0);
        assert_eq!(grace_factor(Some(1_000_000), 1_000_000, grace), 0.0);
        assert_eq!(grace_factor(Some(1_000_000), 1_015_000, grace), 0.5);
        assert_eq!(grace_factor(Some(1_000_000), 1_030_000, grace), 1.0);
        assert_eq!(grace_factor(Some(1_000_000), 2_000_000, grace), 1.0);
    }

    #[test]
    fn select_never_picks_zero_weight_or_draining() {
        let router = router();
        router.report("good", "a", &healthy_metrics()).unwrap();
        router.report("draining", "b", &healthy_metrics()).unwrap();
        router.mark_draining("draining").unwrap();
        for _ in 0..3 {
            router.report("broken", "c", &failing_metrics()).unwrap();
        }

        for _ in 0..50 {
            assert_eq!(router.select().unwrap().id, "good");
        }
    }

    #[test]
    fn select_fails_hard_with_no_candidates() {
        let router = router();
        assert!(matches!(router.select(), Err(RouterError::NoInstanceAvailable)));

        router.report("i-1", "a", &failing_metrics()).unwrap();
        // Unhealthy-but-breaker-closed still has weight > 0, so routable.
        assert_eq!(router.select().unwrap().id, "i-1");

        router.mark_draining("i-1").unwrap();
        assert!(matches!(router.select(), Err(RouterError::NoInstanceAvailable)));
    }

    #[test]
    fn pick_weighted_lands_proportionally() {
        let make = |id: &str, weight: f64| InstanceRecord {
            id: id.to_string(),
            address: "a".to_string(),
            status: InstanceStatus::Healthy,
            score: weight,
            weight,
            consecutive_failures: 0,
            breaker_open: false,
            recovered_at: None,
            updated_at: 0,
        };
        let candidates = vec![make("a", 10.0), make("b", 30.0), make("c", 60.0)];

        assert_eq!(pick_weighted(candidates.clone(), 0.0).id, "a");
        assert_eq!(pick_weighted(candidates.clone(), 9.9).id, "a");
        assert_eq!(pick_weighted(candidates.clone(), 10.0).id, "b");
        assert_eq!(pick_weighted(candidates.clone(), 39.9).id, "b");
        assert_eq!(pick_weighted(candidates.clone(), 40.0).id, "c");
        assert_eq!(pick_weighted(candidates, 99.9).id, "c");
    }

    #[test]
    fn stale_instances_are_swept_offline() {
        let store = SharedStore::open_in_memory().unwrap();
        let router = HealthRouter::new(store.clone(), RouterConfig::default());

        router.report("fresh", "a", &healthy_metrics()).unwrap();

        // Backdate one record beyond 2x the check interval.
        let mut stale = router.report("stale", "b", &healthy_metrics()).unwrap();
        stale.updated_at = epoch_millis() - 60_000;
        store
            .set("instance:stale", &serde_json::to_string(&stale).unwrap(), None)
            .unwrap();

        assert_eq!(router.sweep_stale().unwrap(), vec!["stale".to_string()]);
        let swept = router.get("stale").unwrap().unwrap();
        assert_eq!(swept.status, InstanceStatus::Offline);
        assert_eq!(swept.weight, 0.0);

        // Only the fresh instance is ever selected afterwards.
        assert_eq!(router.select().unwrap().id, "fresh");
    }

    #[test]
    fn deregister_removes_the_record() {
        let router = router();
        router.report("i-1", "a", &healthy_metrics()).unwrap();
        assert!(router.deregister("i-1").unwrap());
        assert!(router.get("i-1").unwrap().is_none());
        assert!(!router.deregister("i-1").unwrap());
    }
}
