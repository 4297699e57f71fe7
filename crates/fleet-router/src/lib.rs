//! fleet-router — health-aware request routing.
//!
//! Converts self-reported instance metrics into a 0–100 health score,
//! derives a routing weight (scaled through a post-failure grace period,
//! zeroed by an open circuit breaker), and selects instances by weighted
//! random draw. Records live in the shared store, so every node routes
//! on the same eventually-consistent view.

pub mod error;
pub mod router;
pub mod score;

pub use error::{RouterError, RouterResult};
pub use router::{HealthRouter, InstanceRecord, RouterConfig};
pub use score::{band, compute_score, InstanceMetrics, InstanceStatus, ScoreConfig};
