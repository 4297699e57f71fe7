//! SharedStore — redb-backed TTL key-value store.
//!
//! Values are JSON-serialized `Entry` records carrying an optional
//! expiry in Unix milliseconds. Every compare-and-act operation runs in
//! one write transaction, which is redb's native atomicity facility.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Entries keyed by caller-chosen string keys (`lock:{key}`,
/// `instance:{id}`, `affinity:{session}`, ...).
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// A stored value plus optional expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Entry {
    value: String,
    /// Unix timestamp (ms) after which the entry is considered absent.
    expires_at: Option<u64>,
}

impl Entry {
    fn live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|t| t > now)
    }
}

/// Thread-safe shared store backed by redb.
#[derive(Clone)]
pub struct SharedStore {
    db: Arc<Database>,
}

impl SharedStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_table()?;
        debug!(?path, "shared store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_table()?;
        debug!("in-memory shared store opened");
        Ok(store)
    }

    fn ensure_table(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Plain reads and writes ─────────────────────────────────────

    /// Set a key unconditionally, with an optional TTL.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| epoch_millis() + t.as_millis() as u64),
        };
        let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a key's value. Expired entries read as absent.
    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = epoch_millis();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: Entry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(entry.live(now).then_some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Delete a key. Returns true if a live entry existed.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            existed = match table.remove(key).map_err(map_err!(Write))? {
                Some(guard) => {
                    let entry: Entry =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    entry.live(now)
                }
                None => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Remaining TTL of a live entry, if it has one.
    pub fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = epoch_millis();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: Entry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(entry
                    .expires_at
                    .filter(|&t| t > now)
                    .map(|t| Duration::from_millis(t - now)))
            }
            None => Ok(None),
        }
    }

    /// List all live `(key, value)` pairs under a key prefix.
    pub fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let now = epoch_millis();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for item in table.iter().map_err(map_err!(Read))? {
            let (key, value) = item.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let entry: Entry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if entry.live(now) {
                    results.push((key.value().to_string(), entry.value));
                }
            }
        }
        Ok(results)
    }

    // ── Atomic compare-and-act ─────────────────────────────────────

    /// Conditional "set if absent with expiry" — the lock-acquisition
    /// primitive. An expired entry counts as absent. Returns true if the
    /// key was set.
    pub fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let occupied = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    let entry: Entry =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    entry.live(now)
                }
                None => false,
            };
            if occupied {
                acquired = false;
            } else {
                let entry = Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl.as_millis() as u64),
                };
                let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                acquired = true;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Delete the key only if its current live value equals `expected`.
    pub fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.compare_and_act(key, expected, |_table_value| None)
    }

    /// Reset the key's TTL only if its current live value equals `expected`.
    pub fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = epoch_millis();
        self.compare_and_act(key, expected, move |entry| {
            Some(Entry {
                expires_at: Some(now + ttl.as_millis() as u64),
                ..entry
            })
        })
    }

    /// Add to the key's remaining TTL only if its current live value
    /// equals `expected`.
    pub fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        extra: Duration,
    ) -> StoreResult<bool> {
        let now = epoch_millis();
        self.compare_and_act(key, expected, move |entry| {
            let base = entry.expires_at.unwrap_or(now);
            Some(Entry {
                expires_at: Some(base + extra.as_millis() as u64),
                ..entry
            })
        })
    }

    /// Reap expired entries. Returns the number removed.
    pub fn sweep_expired(&self) -> StoreResult<u32> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let dead: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|item| {
                    let (key, value) = item.ok()?;
                    let entry: Entry = serde_json::from_slice(value.value()).ok()?;
                    (!entry.live(now)).then(|| key.value().to_string())
                })
                .collect();
            for key in &dead {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                removed += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    /// Core compare-then-act: within one write transaction, read the
    /// current entry, compare its live value against `expected`, and if
    /// equal replace the entry with `f(entry)` (or delete it when `f`
    /// returns `None`). Any mismatch is a no-op returning false.
    fn compare_and_act(
        &self,
        key: &str,
        expected: &str,
        f: impl FnOnce(Entry) -> Option<Entry>,
    ) -> StoreResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acted;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let current: Option<Entry> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            match current {
                Some(entry) if entry.live(now) && entry.value == expected => {
                    match f(entry) {
                        Some(updated) => {
                            let bytes =
                                serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
                            table
                                .insert(key, bytes.as_slice())
                                .map_err(map_err!(Write))?;
                        }
                        None => {
                            table.remove(key).map_err(map_err!(Write))?;
                        }
                    }
                    acted = true;
                }
                _ => acted = false,
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acted)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", None).unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn get_missing_returns_none() {
        let store = SharedStore::open_in_memory().unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", Some(Duration::from_millis(20))).unwrap();
        assert!(store.get("k").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn set_if_absent_first_wins() {
        let store = SharedStore::open_in_memory().unwrap();
        assert!(store
            .set_if_absent("lock:deploy", "token-a", Duration::from_secs(30))
            .unwrap());
        assert!(!store
            .set_if_absent("lock:deploy", "token-b", Duration::from_secs(30))
            .unwrap());
        // The original value is untouched.
        assert_eq!(store.get("lock:deploy").unwrap(), Some("token-a".to_string()));
    }

    #[test]
    fn set_if_absent_succeeds_after_expiry() {
        let store = SharedStore::open_in_memory().unwrap();
        assert!(store
            .set_if_absent("lock:k", "a", Duration::from_millis(20))
            .unwrap());

        std::thread::sleep(Duration::from_millis(40));
        assert!(store
            .set_if_absent("lock:k", "b", Duration::from_secs(30))
            .unwrap());
        assert_eq!(store.get("lock:k").unwrap(), Some("b".to_string()));
    }

    #[test]
    fn compare_and_delete_requires_matching_value() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "mine", None).unwrap();

        assert!(!store.compare_and_delete("k", "theirs").unwrap());
        assert_eq!(store.get("k").unwrap(), Some("mine".to_string()));

        assert!(store.compare_and_delete("k", "mine").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn compare_and_set_ttl_refreshes_expiry() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", Some(Duration::from_millis(30))).unwrap();

        assert!(store
            .compare_and_set_ttl("k", "v", Duration::from_secs(60))
            .unwrap());
        let remaining = store.ttl_remaining("k").unwrap().unwrap();
        assert!(remaining > Duration::from_secs(30));
    }

    #[test]
    fn compare_and_set_ttl_mismatch_is_noop() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", Some(Duration::from_secs(1))).unwrap();

        assert!(!store
            .compare_and_set_ttl("k", "other", Duration::from_secs(60))
            .unwrap());
        // TTL unchanged (still roughly 1s).
        let remaining = store.ttl_remaining("k").unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(1));
    }

    #[test]
    fn compare_and_extend_adds_to_remaining_ttl() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", Some(Duration::from_secs(10))).unwrap();

        assert!(store
            .compare_and_extend("k", "v", Duration::from_secs(10))
            .unwrap());
        let remaining = store.ttl_remaining("k").unwrap().unwrap();
        assert!(remaining > Duration::from_secs(15));
    }

    #[test]
    fn stale_holder_cannot_touch_reacquired_key() {
        let store = SharedStore::open_in_memory().unwrap();
        store
            .set_if_absent("lock:k", "old-token", Duration::from_millis(20))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        // A new holder takes the expired key.
        assert!(store
            .set_if_absent("lock:k", "new-token", Duration::from_secs(30))
            .unwrap());

        // The stale holder's operations must all be safe no-ops.
        assert!(!store.compare_and_delete("lock:k", "old-token").unwrap());
        assert!(!store
            .compare_and_set_ttl("lock:k", "old-token", Duration::from_secs(60))
            .unwrap());
        assert!(!store
            .compare_and_extend("lock:k", "old-token", Duration::from_secs(60))
            .unwrap());
        assert_eq!(store.get("lock:k").unwrap(), Some("new-token".to_string()));
    }

    #[test]
    fn delete_reports_liveness() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", None).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn list_prefix_filters_keys_and_expired() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("instance:a", "1", None).unwrap();
        store.set("instance:b", "2", None).unwrap();
        store
            .set("instance:c", "3", Some(Duration::from_millis(10)))
            .unwrap();
        store.set("lock:x", "4", None).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let instances = store.list_prefix("instance:").unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|(k, _)| k.starts_with("instance:")));
    }

    #[test]
    fn sweep_expired_reaps_only_dead_entries() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("a", "1", Some(Duration::from_millis(10))).unwrap();
        store.set("b", "2", None).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert_eq!(store.get("b").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn ttl_remaining_none_without_expiry() {
        let store = SharedStore::open_in_memory().unwrap();
        store.set("k", "v", None).unwrap();
        assert_eq!(store.ttl_remaining("k").unwrap(), None);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");

        {
            let store = SharedStore::open(&path).unwrap();
            store.set("k", "v", None).unwrap();
        }

        let store = SharedStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn concurrent_set_if_absent_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(SharedStore::open_in_memory().unwrap());
        let mut handles = vec![];
        for i in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                store
                    .set_if_absent("lock:contested", &format!("token-{i}"), Duration::from_secs(30))
                    .unwrap()
            }));
        }

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }
}
