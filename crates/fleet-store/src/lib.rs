//! fleet-store — shared TTL key-value store for Fleet.
//!
//! Backed by [redb](https://docs.rs/redb), this is the store the Health
//! Router and Distributed Lock coordinate through. Entries carry an
//! optional expiry; expired entries are treated as absent and reaped
//! lazily.
//!
//! # Atomicity
//!
//! The compare-and-act operations (`set_if_absent`,
//! `compare_and_delete`, `compare_and_set_ttl`, `compare_and_extend`)
//! each run inside a single write transaction, so "read current value,
//! compare, then mutate" is indivisible with respect to all other
//! writers. Lock correctness depends on this — a stale holder's release
//! or renew must never touch a key that has since been reacquired.

pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::SharedStore;
