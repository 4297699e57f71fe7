//! fleetd — the Fleet daemon.
//!
//! Single binary that assembles all Fleet subsystems:
//! - Service registry (persisted to disk)
//! - Shared TTL store (redb)
//! - Service controller + audit log
//! - Health monitor
//! - Auto-recovery + escalation journal
//! - Health router
//! - Autoscaler (optional)
//! - Graceful shutdown pipeline
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml
//! fleetd status --config /etc/fleet/fleet.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_control::{AuditLog, ServiceController};
use fleet_health::{HealthMonitor, UnhealthyCallback};
use fleet_lock::LockManager;
use fleet_recovery::{EscalationLog, RecoveryManager};
use fleet_registry::ServiceRegistry;
use fleet_router::HealthRouter;
use fleet_scale::{AutoScaler, ProcMetrics, RequestCounter, ScalingJournal, ShellOrchestrator};
use fleet_shutdown::{ConnectionTracker, ShutdownCoordinator};
use fleet_store::SharedStore;

mod config;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: manage, monitor, and recover the configured services.
    Run {
        /// Path to the daemon config file.
        #[arg(long, default_value = "/etc/fleet/fleet.toml")]
        config: PathBuf,
    },
    /// Print the registry summary for a configured data directory.
    Status {
        #[arg(long, default_value = "/etc/fleet/fleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(DaemonConfig::load(&config)?).await,
        Command::Status { config } => status(DaemonConfig::load(&config)?),
    }
}

fn status(config: DaemonConfig) -> anyhow::Result<()> {
    let registry = ServiceRegistry::open(&config.data_dir.join("registry.json"));
    let summary = registry.summary();
    println!(
        "services: {} total | {} running, {} unhealthy, {} stopped, {} starting, {} stopping, {} unknown",
        summary.total,
        summary.running,
        summary.unhealthy,
        summary.stopped,
        summary.starting,
        summary.stopping,
        summary.unknown
    );
    for state in registry.list() {
        println!(
            "  {:20} port {:5} {:?} restarts={} failures={}",
            state.name, state.port, state.status, state.restart_count, state.consecutive_failures
        );
    }
    Ok(())
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("fleet daemon starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let instance_id = config
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("fleet-{}", uuid::Uuid::new_v4()));
    info!(instance = %instance_id, data_dir = ?config.data_dir, "node identity");

    // ── Initialize subsystems ──────────────────────────────────

    let registry = ServiceRegistry::open(&config.data_dir.join("registry.json"));
    info!(services = registry.list().len(), "service registry loaded");

    let store = SharedStore::open(&config.data_dir.join("fleet.redb"))?;
    info!("shared store opened");

    let audit = AuditLog::new(&config.data_dir.join("audit.log"));
    let controller = ServiceController::new(registry.clone(), audit);

    let escalation_log = EscalationLog::new(&config.data_dir.join("escalations.log"));
    let recovery = Arc::new(RecoveryManager::new(
        registry.clone(),
        Arc::new(controller.clone()),
        config.recovery.to_config(),
        escalation_log,
    ));
    info!(
        max_attempts = config.recovery.max_attempts,
        cooldown_secs = config.recovery.cooldown_secs,
        "auto-recovery initialized"
    );

    let router = HealthRouter::new(store.clone(), config.router.to_config());
    let locks = LockManager::new(store.clone());
    let tracker = ConnectionTracker::new();

    // ── Start managed services ─────────────────────────────────

    for service in config.services.iter().filter(|s| s.enabled) {
        match controller.start(service).await {
            Ok(pid) => info!(service = %service.name, pid, "service started"),
            Err(e) => warn!(service = %service.name, error = %e, "service failed to start"),
        }
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Health monitor feeding recovery.
    let on_unhealthy: UnhealthyCallback = {
        let recovery = recovery.clone();
        Arc::new(move |service, result| {
            let recovery = recovery.clone();
            Box::pin(async move {
                if let Err(e) = recovery.handle_unhealthy(&service, &result).await {
                    warn!(service = %service.name, error = %e, "recovery failed");
                }
            })
        })
    };
    let monitor = HealthMonitor::new(registry.clone(), config.services.clone())
        .with_interval(Duration::from_secs(config.monitor.interval_secs))
        .with_timeout(Duration::from_secs(config.monitor.timeout_secs))
        .with_callback(on_unhealthy);
    monitor.start();

    // Restart-counter stability sweep.
    let sweep_handle = {
        let recovery = recovery.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.recovery.cooldown_secs);
        tokio::spawn(async move {
            recovery.run_stability_sweep(interval, shutdown).await;
        })
    };

    // Router staleness sweep.
    let router_handle = {
        let router = router.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            router.run_sweep(shutdown).await;
        })
    };

    // Autoscaler, when configured.
    let scaler_handle = if config.scaling.enabled {
        let orchestrator = Arc::new(ShellOrchestrator::new(
            &config.scaling.scale_command,
            &config.scaling.count_command,
        ));
        let tracker_for_scaler = tracker.clone();
        let scaler = AutoScaler::new(
            config.scaling.to_config(),
            orchestrator,
            Arc::new(ProcMetrics),
            RequestCounter::default(),
            ScalingJournal::new(&config.data_dir.join("scaling.log")),
        )
        .with_connection_count(Arc::new(move || tracker_for_scaler.active()));
        info!(service = %config.scaling.service, "autoscaler initialized");

        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            scaler.run(shutdown).await;
        }))
    } else {
        None
    };

    // ── Wait for the shutdown signal ───────────────────────────

    let coordinator = ShutdownCoordinator::new(
        &instance_id,
        router,
        locks,
        store,
        tracker,
        config.shutdown.to_config(),
    );

    // Thin signal shim; the pipeline itself lives behind the explicit
    // initiate_shutdown entry point.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    monitor.stop();

    let report = coordinator.initiate_shutdown().await?;
    if !report.completed {
        warn!(duration_ms = report.duration_ms, "shutdown forced by overall timeout");
    }

    // Stop the managed services last so health checks are already quiet.
    for service in config.services.iter().filter(|s| s.enabled) {
        if let Err(e) = controller.stop(service).await {
            warn!(service = %service.name, error = %e, "service failed to stop");
        }
    }

    let _ = sweep_handle.await;
    let _ = router_handle.await;
    if let Some(handle) = scaler_handle {
        let _ = handle.await;
    }

    info!("fleet daemon stopped");
    Ok(())
}
