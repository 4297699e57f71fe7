//! fleet-lock — distributed mutual exclusion over the shared store.
//!
//! The only strong cross-process coordination primitive in Fleet; every
//! other subsystem tolerates stale reads. Correctness rests on two
//! properties of the store: set-if-absent is atomic (one winner under
//! contention) and release/renew/extend compare the holder token inside
//! the same transaction that mutates (a stale holder can never touch a
//! reacquired lock).

pub mod error;
pub mod lock;

pub use error::{LockError, LockResult};
pub use lock::{Lock, LockManager, LockOptions, LostLockCallback};
