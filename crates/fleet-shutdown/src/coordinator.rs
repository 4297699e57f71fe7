//! Shutdown coordinator — the ordered stage pipeline.
//!
//! Stages run in a fixed order, each bounded by a per-stage timeout and
//! error-isolated: a failed or timed-out stage is recorded and the
//! pipeline moves on. Bounded shutdown latency is deliberately traded
//! for strict per-stage correctness. An independent overall timeout
//! forces completion if the whole sequence hangs.
//!
//! ```text
//! mark draining → stop accepting → drain connections → migrate affinity
//!   → grace period → release locks → close store → deregister
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use fleet_lock::LockManager;
use fleet_router::{HealthRouter, InstanceStatus};
use fleet_store::SharedStore;

use crate::error::{ShutdownError, ShutdownResult};
use crate::tracker::ConnectionTracker;

/// Shutdown timing knobs.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Bound on waiting for in-flight connections to finish.
    pub drain_timeout: Duration,
    /// Pause for in-flight work after draining.
    pub grace_period: Duration,
    /// Bound on every other individual stage.
    pub stage_timeout: Duration,
    /// Bound on the whole pipeline, independent of stage timeouts.
    pub overall_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            stage_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: &'static str,
    pub ok: bool,
    pub timed_out: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub stages: Vec<StageResult>,
    /// False when the overall timeout cut the pipeline short.
    pub completed: bool,
    pub duration_ms: u64,
}

/// Runs the graceful shutdown pipeline for one instance.
pub struct ShutdownCoordinator {
    instance_id: String,
    router: HealthRouter,
    locks: LockManager,
    /// Taken and dropped by the close-store stage.
    store: Mutex<Option<SharedStore>>,
    tracker: ConnectionTracker,
    accepting: Arc<AtomicBool>,
    config: ShutdownConfig,
    initiated: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(
        instance_id: &str,
        router: HealthRouter,
        locks: LockManager,
        store: SharedStore,
        tracker: ConnectionTracker,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            router,
            locks,
            store: Mutex::new(Some(store)),
            tracker,
            accepting: Arc::new(AtomicBool::new(true)),
            config,
            initiated: AtomicBool::new(false),
        }
    }

    /// Whether new inbound connections should be accepted. Listeners
    /// consult this flag; it flips during the pipeline.
    pub fn accepting(&self) -> Arc<AtomicBool> {
        self.accepting.clone()
    }

    /// Run the shutdown pipeline. The explicit entry point a signal
    /// shim (or an operator command) calls; the second call is an error.
    pub async fn initiate_shutdown(&self) -> ShutdownResult<ShutdownReport> {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyInitiated);
        }
        info!(instance = %self.instance_id, "graceful shutdown initiated");
        let started = Instant::now();

        let results = Arc::new(Mutex::new(Vec::new()));
        let pipeline = self.run_pipeline(results.clone());
        let completed = tokio::time::timeout(self.config.overall_timeout, pipeline)
            .await
            .is_ok();
        if !completed {
            warn!(
                instance = %self.instance_id,
                timeout_secs = self.config.overall_timeout.as_secs(),
                "overall shutdown timeout exceeded, forcing completion"
            );
        }

        let report = ShutdownReport {
            stages: lock(&results).clone(),
            completed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            instance = %self.instance_id,
            completed = report.completed,
            duration_ms = report.duration_ms,
            stages = report.stages.len(),
            "graceful shutdown finished"
        );
        Ok(report)
    }

    async fn run_pipeline(&self, results: Arc<Mutex<Vec<StageResult>>>) {
        let stage_timeout = self.config.stage_timeout;

        self.stage(&results, "mark_draining", stage_timeout, async {
            self.router.mark_draining(&self.instance_id)?;
            Ok(())
        })
        .await;

        self.stage(&results, "stop_accepting", stage_timeout, async {
            self.accepting.store(false, Ordering::SeqCst);
            Ok(())
        })
        .await;

        // Draining is bounded by its own timeout; stragglers past it are
        // force-closed rather than waited on.
        self.stage(
            &results,
            "drain_connections",
            self.config.drain_timeout + Duration::from_secs(1),
            async {
                if !self.tracker.wait_for_drain(self.config.drain_timeout).await {
                    warn!(
                        instance = %self.instance_id,
                        remaining = self.tracker.active(),
                        "drain timeout, force-closing remaining connections"
                    );
                }
                Ok(())
            },
        )
        .await;

        self.stage(&results, "migrate_affinity", stage_timeout, async {
            let migrated = self.migrate_affinity()?;
            if migrated > 0 {
                info!(instance = %self.instance_id, migrated, "session affinity migrated");
            }
            Ok(())
        })
        .await;

        self.stage(
            &results,
            "grace_period",
            self.config.grace_period + Duration::from_secs(1),
            async {
                tokio::time::sleep(self.config.grace_period).await;
                Ok(())
            },
        )
        .await;

        self.stage(&results, "release_locks", stage_timeout, async {
            let released = self.locks.release_all()?;
            if released > 0 {
                info!(instance = %self.instance_id, released, "held locks released");
            }
            Ok(())
        })
        .await;

        self.stage(&results, "close_store", stage_timeout, async {
            // Dropping the last handle closes the backing database.
            lock(&self.store).take();
            Ok(())
        })
        .await;

        self.stage(&results, "deregister", stage_timeout, async {
            self.router.deregister(&self.instance_id)?;
            Ok(())
        })
        .await;
    }

    /// Repoint every session pinned to this instance at a ready peer
    /// chosen at random. Sessions are left pinned when no peer exists.
    fn migrate_affinity(&self) -> anyhow::Result<u32> {
        let guard = lock(&self.store);
        let Some(ref store) = *guard else {
            return Ok(0);
        };

        let peers: Vec<String> = self
            .router
            .list()?
            .into_iter()
            .filter(|r| {
                r.id != self.instance_id && r.status == InstanceStatus::Healthy && r.weight > 0.0
            })
            .map(|r| r.id)
            .collect();

        let mut migrated = 0;
        for (key, holder) in store.list_prefix(AFFINITY_PREFIX)? {
            if holder != self.instance_id {
                continue;
            }
            if peers.is_empty() {
                warn!(session = %key, "no ready peer to migrate session affinity to");
                continue;
            }
            let peer = &peers[rand::thread_rng().gen_range(0..peers.len())];
            store.set(&key, peer, None)?;
            migrated += 1;
        }
        Ok(migrated)
    }

    /// Run one stage with a timeout, recording the outcome. Failures
    /// are logged and isolated; later stages always run.
    async fn stage<F>(
        &self,
        results: &Mutex<Vec<StageResult>>,
        name: &'static str,
        timeout: Duration,
        work: F,
    ) where
        F: Future<Output = anyhow::Result<()>>,
    {
        let started = Instant::now();
        let (ok, timed_out, error) = match tokio::time::timeout(timeout, work).await {
            Ok(Ok(())) => (true, false, None),
            Ok(Err(e)) => (false, false, Some(e.to_string())),
            Err(_) => (false, true, Some(format!("stage timed out after {timeout:?}"))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if ok {
            info!(stage = name, duration_ms, "shutdown stage completed");
        } else {
            warn!(stage = name, duration_ms, error = ?error, "shutdown stage failed, continuing");
        }
        lock(results).push(StageResult {
            stage: name,
            ok,
            timed_out,
            error,
            duration_ms,
        });
    }
}

const AFFINITY_PREFIX: &str = "affinity:";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
