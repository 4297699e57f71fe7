//! AutoScaler — the scaling control loop.
//!
//! Each tick gathers CPU%, memory%, and the rolling request rate,
//! normalizes each against its target, and takes the maximum ratio:
//!
//! ```text
//! ratio = max(cpu / target_cpu,
//!             memory / target_memory,
//!             (rps / replicas) / target_rps_per_instance)
//!
//! ratio >= scale_up_threshold   and replicas < max  → scale to replicas + 1
//! ratio <= scale_down_threshold and replicas > min  → scale to replicas - 1
//! ```
//!
//! Decisions move one instance at a time, never more, and a cooldown
//! window after any action suppresses further actions regardless of
//! load. Replica counts come from the orchestrator and may be slightly
//! stale; one-step moves keep a decision made on stale data cheap to
//! correct on the next tick.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::ScaleResult;
use crate::events::{ScaleDirection, ScalingEvent, ScalingJournal};
use crate::metrics::MetricsSource;
use crate::orchestrator::Orchestrator;
use crate::requests::RequestCounter;

/// Scaling targets and bounds for one service.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub service: String,
    /// Target CPU utilization percent.
    pub target_cpu: f64,
    /// Target memory utilization percent.
    pub target_memory: f64,
    /// Target requests per second per instance.
    pub target_rps_per_instance: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Suppression window after any scaling action.
    pub cooldown: Duration,
    /// Evaluation tick.
    pub interval: Duration,
}

impl ScalerConfig {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            target_cpu: 70.0,
            target_memory: 75.0,
            target_rps_per_instance: 100.0,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            min_instances: 1,
            max_instances: 10,
            cooldown: Duration::from_secs(300),
            interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one evaluation tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    ScaledUp(u32),
    ScaledDown(u32),
    NoChange,
    /// Within the cooldown window since the last action.
    Cooldown,
    /// A previous evaluation's scaling call is still running.
    InProgress,
}

/// Metrics-driven one-step autoscaler.
pub struct AutoScaler {
    config: ScalerConfig,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Arc<dyn MetricsSource>,
    requests: RequestCounter,
    journal: ScalingJournal,
    /// Optional in-flight connection count, observed for diagnostics.
    connections: Option<Arc<dyn Fn() -> u64 + Send + Sync>>,
    last_action: Mutex<Option<u64>>,
    /// Held across the orchestrator call; a busy guard skips the tick.
    evaluation: tokio::sync::Mutex<()>,
}

impl AutoScaler {
    pub fn new(
        config: ScalerConfig,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Arc<dyn MetricsSource>,
        requests: RequestCounter,
        journal: ScalingJournal,
    ) -> Self {
        Self {
            config,
            orchestrator,
            metrics,
            requests,
            journal,
            connections: None,
            last_action: Mutex::new(None),
            evaluation: tokio::sync::Mutex::new(()),
        }
    }

    /// Observe in-flight connections in decision logs.
    pub fn with_connection_count(
        mut self,
        provider: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        self.connections = Some(provider);
        self
    }

    /// Evaluate load once and act on it.
    pub async fn evaluate(&self) -> ScaleResult<ScaleDecision> {
        // A scaling call still in flight blocks a concurrent evaluation.
        let Ok(_guard) = self.evaluation.try_lock() else {
            debug!(service = %self.config.service, "scaling in progress, skipping tick");
            return Ok(ScaleDecision::InProgress);
        };

        // Cooldown applies regardless of load.
        if let Some(last) = *lock(&self.last_action) {
            let since = epoch_millis().saturating_sub(last);
            if since < self.config.cooldown.as_millis() as u64 {
                debug!(service = %self.config.service, since_ms = since, "within scaling cooldown");
                return Ok(ScaleDecision::Cooldown);
            }
        }

        let sample = self.metrics.sample()?;
        let replicas = self.orchestrator.current_replicas(&self.config.service).await?;
        let rps = self.requests.rate_per_sec();
        let connections = self.connections.as_ref().map(|f| f());

        let cpu_ratio = sample.cpu_percent / self.config.target_cpu;
        let memory_ratio = sample.memory_percent / self.config.target_memory;
        let rps_ratio =
            rps / replicas.max(1) as f64 / self.config.target_rps_per_instance;
        let ratio = cpu_ratio.max(memory_ratio).max(rps_ratio);

        debug!(
            service = %self.config.service,
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            rps,
            replicas,
            connections,
            ratio,
            "scaling evaluation"
        );

        if ratio >= self.config.scale_up_threshold && replicas < self.config.max_instances {
            let target = replicas + 1;
            self.scale(replicas, target, ScaleDirection::Up, ratio).await?;
            Ok(ScaleDecision::ScaledUp(target))
        } else if ratio <= self.config.scale_down_threshold && replicas > self.config.min_instances
        {
            let target = replicas - 1;
            self.scale(replicas, target, ScaleDirection::Down, ratio).await?;
            Ok(ScaleDecision::ScaledDown(target))
        } else {
            Ok(ScaleDecision::NoChange)
        }
    }

    async fn scale(
        &self,
        from: u32,
        to: u32,
        direction: ScaleDirection,
        ratio: f64,
    ) -> ScaleResult<()> {
        info!(
            service = %self.config.service,
            from,
            to,
            ratio,
            ?direction,
            "scaling service"
        );
        self.orchestrator.scale_to(&self.config.service, to).await?;
        *lock(&self.last_action) = Some(epoch_millis());
        self.journal.append_best_effort(&ScalingEvent {
            service: self.config.service.clone(),
            direction,
            from_replicas: from,
            to_replicas: to,
            load_ratio: ratio,
            timestamp: epoch_millis(),
        });
        Ok(())
    }

    /// Shared request counter for request paths to record into.
    pub fn request_counter(&self) -> RequestCounter {
        self.requests.clone()
    }

    /// Run the evaluation loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            service = %self.config.service,
            interval_secs = self.config.interval.as_secs(),
            "autoscaler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.evaluate().await {
                        warn!(service = %self.config.service, error = %e, "scaling evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(service = %self.config.service, "autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
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
    use crate::metrics::SystemMetrics;
    use crate::orchestrator::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeOrchestrator {
        replicas: AtomicU32,
        delay: Duration,
    }

    impl FakeOrchestrator {
        fn new(replicas: u32) -> Self {
            Self {
                replicas: AtomicU32::new(replicas),
                delay: Duration::ZERO,
            }
        }

        fn replicas(&self) -> u32 {
            self.replicas.load(Ordering::SeqCst)
        }
    }

    impl Orchestrator for FakeOrchestrator {
        fn current_replicas(&self, _service: &str) -> BoxFuture<anyhow::Result<u32>> {
            let n = self.replicas.load(Ordering::SeqCst);
            Box::pin(async move { Ok(n) })
        }

        fn scale_to(&self, _service: &str, replicas: u32) -> BoxFuture<anyhow::Result<()>> {
            let delay = self.delay;
            self.replicas.store(replicas, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    struct FixedMetrics(SystemMetrics);

    impl MetricsSource for FixedMetrics {
        fn sample(&self) -> ScaleResult<SystemMetrics> {
            Ok(self.0)
        }
    }

    fn metrics(cpu: f64, memory: f64) -> Arc<FixedMetrics> {
        Arc::new(FixedMetrics(SystemMetrics {
            cpu_percent: cpu,
            memory_percent: memory,
        }))
    }

    fn scaler(
        config: ScalerConfig,
        orchestrator: Arc<FakeOrchestrator>,
        source: Arc<FixedMetrics>,
    ) -> AutoScaler {
        AutoScaler::new(
            config,
            orchestrator,
            source,
            RequestCounter::default(),
            ScalingJournal::disabled(),
        )
    }

    #[tokio::test]
    async fn high_cpu_scales_up_once_then_cooldown_holds() {
        // cpu 85 / target 70 = ~1.21 ratio, past the 0.8 threshold.
        let orchestrator = Arc::new(FakeOrchestrator::new(2));
        let scaler = scaler(
            ScalerConfig::new("api"),
            orchestrator.clone(),
            metrics(85.0, 30.0),
        );

        assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::ScaledUp(3));
        assert_eq!(orchestrator.replicas(), 3);

        // Identical load inside the cooldown window: no action.
        assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::Cooldown);
        assert_eq!(orchestrator.replicas(), 3);
    }

    #[tokio::test]
    async fn low_load_scales_down_one_step() {
        let orchestrator = Arc::new(FakeOrchestrator::new(4));
        let scaler = scaler(
            ScalerConfig::new("api"),
            orchestrator.clone(),
            metrics(10.0, 15.0),
        );

        assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::ScaledDown(3));
        assert_eq!(orchestrator.replicas(), 3);
    }

    #[tokio::test]
    async fn moderate_load_takes_no_action() {
        let orchestrator = Arc::new(FakeOrchestrator::new(2));
        // cpu 40/70 ≈ 0.57: between the thresholds.
        let scaler = scaler(
            ScalerConfig::new("api"),
            orchestrator.clone(),
            metrics(40.0, 30.0),
        );

        assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::NoChange);
        assert_eq!(orchestrator.replicas(), 2);
    }

    #[tokio::test]
    async fn bounds_clamp_scaling() {
        let config = ScalerConfig {
            min_instances: 2,
            max_instances: 2,
            ..ScalerConfig::new("api")
        };

        let orchestrator = Arc::new(FakeOrchestrator::new(2));
        let up = scaler(config.clone(), orchestrator.clone(), metrics(95.0, 30.0));
        assert_eq!(up.evaluate().await.unwrap(), ScaleDecision::NoChange);

        let down = scaler(config, orchestrator.clone(), metrics(5.0, 5.0));
        assert_eq!(down.evaluate().await.unwrap(), ScaleDecision::NoChange);
        assert_eq!(orchestrator.replicas(), 2);
    }

    #[tokio::test]
    async fn request_rate_alone_can_trigger_scale_up() {
        let orchestrator = Arc::new(FakeOrchestrator::new(1));
        let counter = RequestCounter::new(Duration::from_secs(60));
        let scaler = AutoScaler::new(
            ScalerConfig::new("api"),
            orchestrator.clone(),
            metrics(10.0, 10.0),
            counter.clone(),
            ScalingJournal::disabled(),
        );

        // Push the rolling rate well past 100 rps for one instance.
        counter.record(100_000);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::ScaledUp(2));
    }

    #[tokio::test]
    async fn in_flight_scaling_blocks_concurrent_evaluation() {
        let mut orchestrator = FakeOrchestrator::new(2);
        orchestrator.delay = Duration::from_millis(200);
        let orchestrator = Arc::new(orchestrator);

        let scaler = Arc::new(scaler(
            ScalerConfig::new("api"),
            orchestrator.clone(),
            metrics(95.0, 30.0),
        ));

        let (a, b) = tokio::join!(scaler.evaluate(), scaler.evaluate());
        let outcomes = [a.unwrap(), b.unwrap()];

        assert!(outcomes.contains(&ScaleDecision::ScaledUp(3)));
        assert!(outcomes.contains(&ScaleDecision::InProgress));
        assert_eq!(orchestrator.replicas(), 3);
    }

    #[tokio::test]
    async fn scaling_actions_are_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaling.log");

        let orchestrator = Arc::new(FakeOrchestrator::new(2));
        let scaler = AutoScaler::new(
            ScalerConfig::new("api"),
            orchestrator,
            metrics(85.0, 30.0),
            RequestCounter::default(),
            ScalingJournal::new(&path),
        );
        scaler.evaluate().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let event: ScalingEvent = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(event.service, "api");
        assert_eq!(event.from_replicas, 2);
        assert_eq!(event.to_replicas, 3);
        assert!(event.load_ratio > 0.8);
    }
}
