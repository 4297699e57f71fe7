//! fleet-shutdown — bounded-latency graceful shutdown.
//!
//! An ordered pipeline takes an instance out of service: drain traffic,
//! migrate session affinity to a peer, release coordination state, then
//! deregister. Stage failures are isolated so a broken collaborator
//! cannot wedge the exit, and an overall timeout caps total shutdown
//! latency no matter what.

pub mod coordinator;
pub mod error;
pub mod tracker;

pub use coordinator::{ShutdownConfig, ShutdownCoordinator, ShutdownReport, StageResult};
pub use error::{ShutdownError, ShutdownResult};
pub use tracker::{ConnectionGuard, ConnectionTracker};
