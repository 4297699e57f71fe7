//! fleet-registry — durable per-service lifecycle state for Fleet.
//!
//! The `ServiceRegistry` owns one `ServiceState` per managed service and
//! exposes named transition operations (`mark_running`, `mark_unhealthy`,
//! ...) that are the only way state is mutated. Every mutation is flushed
//! to a human-readable JSON file via an atomic write-then-rename, and the
//! registry reloads that file on construction.
//!
//! # Consistency
//!
//! Each service's state is independently consistent; there is no
//! transactional guarantee across services. A missing or corrupt state
//! file degrades to an empty registry (logged, never fatal).

pub mod error;
pub mod registry;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::{RegistrySummary, ServiceRegistry};
pub use types::*;
