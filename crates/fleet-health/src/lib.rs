//! fleet-health — health checking for managed services.
//!
//! The `HealthMonitor` sweeps every enabled service on a fixed interval
//! (one immediate sweep plus a recurring ticker), probing each service's
//! health endpoint with a bounded timeout. Any response in [200,400) is
//! healthy; anything else — including 5xx and transport-level failures —
//! is unhealthy, with the raw error text retained for classification.
//!
//! Each tick marks the registry healthy/unhealthy per result and invokes
//! a caller-supplied callback only on unhealthy results. Services are
//! checked in turn; a hung service delays the tick by at most its own
//! probe timeout.

pub mod checker;
pub mod monitor;

pub use checker::probe;
pub use monitor::{HealthMonitor, UnhealthyCallback};
