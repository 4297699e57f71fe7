//! fleet-control — process lifecycle control for managed services.
//!
//! The `ServiceController` starts, stops, and restarts the OS process
//! behind a named service, remediating port conflicts before starting
//! and escalating from graceful to forced termination on stop. Every
//! operation appends one line to an append-only audit journal.
//!
//! Side effects are local to the OS process table and the filesystem;
//! the controller makes no network calls.

pub mod audit;
pub mod controller;
pub mod error;
pub mod process;

pub use audit::{AuditLog, AuditRecord};
pub use controller::ServiceController;
pub use error::{ControlError, ControlResult};
