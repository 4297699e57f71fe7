//! fleet-scale — metrics-driven autoscaling.
//!
//! A control loop samples host utilization and the rolling request
//! rate, normalizes each against its target, and moves the replica
//! count of a service by at most one instance per decision through an
//! [`Orchestrator`] seam. A cooldown window after each action prevents
//! thrashing; every action lands in an append-only journal.

pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod requests;
pub mod scaler;

pub use error::{ScaleError, ScaleResult};
pub use events::{ScaleDirection, ScalingEvent, ScalingJournal};
pub use metrics::{MetricsSource, ProcMetrics, SystemMetrics};
pub use orchestrator::{Orchestrator, ShellOrchestrator};
pub use requests::RequestCounter;
pub use scaler::{AutoScaler, ScaleDecision, ScalerConfig};
