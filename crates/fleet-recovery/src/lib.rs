//! fleet-recovery — automatic restart of unhealthy services.
//!
//! Consumes the health monitor's unhealthy signal and decides, per
//! service, whether to restart, wait, or escalate:
//!
//! ```text
//! unhealthy signal
//!   ├── recovery already in flight?      → skip
//!   ├── within cooldown window?          → skip
//!   ├── restart budget exhausted?
//!   │     └── escalation threshold met?  → escalation record + callback
//!   └── classify error
//!         ├── port_conflict  → free the port first
//!         ├── timeout        → wait longer first
//!         └── otherwise      → restart immediately
//! ```
//!
//! A periodic stability sweep resets a service's restart counter once it
//! has stayed running for at least twice the cooldown period, so a
//! historically flaky but now stable service is not permanently capped.

pub mod classify;
pub mod error;
pub mod escalation;
pub mod recovery;

pub use classify::ErrorCategory;
pub use error::{RecoveryError, RecoveryResult};
pub use escalation::{EscalationLog, EscalationRecord};
pub use recovery::{RecoveryConfig, RecoveryManager, RecoveryOutcome, Restarter};
