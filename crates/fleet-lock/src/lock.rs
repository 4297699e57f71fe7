//! Distributed lock over the shared TTL store.
//!
//! Acquisition is a conditional set-if-absent with a random token and a
//! TTL; release, renew, and extend are token-compared atomic operations,
//! so a stale holder can never mutate a lock that has since been
//! reacquired. An optional renewal task keeps long-held locks alive and
//! reports loss of ownership through a callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_store::SharedStore;

use crate::error::{LockError, LockResult};

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Callback invoked with the lock key when a renewal discovers the lock
/// was lost. The caller's in-progress work is unprotected from that
/// point and must react.
pub type LostLockCallback = Arc<dyn Fn(String) -> BoxFuture<()> + Send + Sync>;

/// Acquisition tuning for a single lock.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lock expiry absent renewal.
    pub ttl: Duration,
    /// Additional attempts after the first before giving up.
    pub retry_count: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// When set, arm a background task renewing the TTL at this interval.
    pub renew_interval: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
            renew_interval: None,
        }
    }
}

/// A held lock. Dropping the handle stops the renewal task but does not
/// release the key; an unreleased lock expires with its TTL.
pub struct Lock {
    key: String,
    token: String,
    ttl: Duration,
    renewal_stop: Option<watch::Sender<bool>>,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The holder token, for introspection and tests.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn stop_renewal(&mut self) {
        if let Some(stop) = self.renewal_stop.take() {
            let _ = stop.send(true);
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

/// Acquires and manages locks against the shared store.
#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    on_lost: Option<LostLockCallback>,
    /// `key → token` for locks this manager acquired and still believes
    /// it holds. The store is shared across instances, so every mutating
    /// operation is token-compared; this map only scopes which keys are
    /// ours to touch.
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl LockManager {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            on_lost: None,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the callback fired when a renewal loses ownership.
    pub fn with_lost_callback(mut self, callback: LostLockCallback) -> Self {
        self.on_lost = Some(callback);
        self
    }

    /// Attempt acquisition, retrying per the options. Returns `None`
    /// when the lock is held by someone else after all attempts.
    pub async fn try_acquire(&self, key: &str, opts: &LockOptions) -> LockResult<Option<Lock>> {
        let token = Uuid::new_v4().to_string();
        let storage_key = storage_key(key);
        let attempts = opts.retry_count + 1;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(opts.retry_delay).await;
            }
            if self.store.set_if_absent(&storage_key, &token, opts.ttl)? {
                debug!(key, attempt, "lock acquired");
                lock_map(&self.held).insert(key.to_string(), token.clone());
                let renewal_stop = opts
                    .renew_interval
                    .map(|interval| self.spawn_renewal(key, &token, opts.ttl, interval));
                return Ok(Some(Lock {
                    key: key.to_string(),
                    token,
                    ttl: opts.ttl,
                    renewal_stop,
                }));
            }
        }
        debug!(key, attempts, "lock not acquired");
        Ok(None)
    }

    /// Acquire or fail with [`LockError::NotAcquired`].
    pub async fn acquire(&self, key: &str, opts: &LockOptions) -> LockResult<Lock> {
        self.try_acquire(key, opts)
            .await?
            .ok_or_else(|| LockError::NotAcquired {
                key: key.to_string(),
                attempts: opts.retry_count + 1,
            })
    }

    /// Release the lock. Returns false when the token no longer matched;
    /// in that case the current holder's lock is untouched.
    pub async fn release(&self, mut lock: Lock) -> LockResult<bool> {
        self.release_inner(&mut lock)
    }

    fn release_inner(&self, lock: &mut Lock) -> LockResult<bool> {
        lock.stop_renewal();
        self.forget(&lock.key, &lock.token);
        let released = self
            .store
            .compare_and_delete(&storage_key(&lock.key), &lock.token)?;
        if !released {
            warn!(key = %lock.key, "release skipped, lock no longer held by this token");
        }
        Ok(released)
    }

    /// Reset the lock's TTL to its original value. Returns false when
    /// ownership was lost.
    pub async fn renew(&self, lock: &Lock) -> LockResult<bool> {
        let renewed = self
            .store
            .compare_and_set_ttl(&storage_key(&lock.key), &lock.token, lock.ttl)?;
        if !renewed {
            self.forget(&lock.key, &lock.token);
        }
        Ok(renewed)
    }

    /// Add to the lock's remaining TTL. Returns false when ownership was
    /// lost.
    pub async fn extend(&self, lock: &Lock, extra: Duration) -> LockResult<bool> {
        let extended = self
            .store
            .compare_and_extend(&storage_key(&lock.key), &lock.token, extra)?;
        if !extended {
            self.forget(&lock.key, &lock.token);
        }
        Ok(extended)
    }

    /// Drop local bookkeeping for a key, but only while it still maps to
    /// the given token.
    fn forget(&self, key: &str, token: &str) {
        let mut held = lock_map(&self.held);
        if held.get(key).is_some_and(|t| t == token) {
            held.remove(key);
        }
    }

    /// Whether any holder currently owns the key.
    pub fn is_locked(&self, key: &str) -> LockResult<bool> {
        Ok(self.store.get(&storage_key(key))?.is_some())
    }

    /// Remaining TTL of the lock, if held.
    pub fn ttl_remaining(&self, key: &str) -> LockResult<Option<Duration>> {
        Ok(self.store.ttl_remaining(&storage_key(key))?)
    }

    /// Run `work` under the lock, releasing on every exit path — a
    /// panic unwinding out of `work` still releases through the guard.
    /// Acquisition failure is an error.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, opts: &LockOptions, work: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.acquire(key, opts).await?;
        let mut guard = ReleaseGuard {
            manager: self,
            lock: Some(lock),
        };
        let result = work().await;
        if let Some(lock) = guard.lock.take() {
            self.release(lock).await?;
        }
        Ok(result)
    }

    /// Run `work` under the lock if it can be acquired, else return
    /// `None` without running it. Release follows every exit path, as
    /// with [`with_lock`](Self::with_lock).
    pub async fn try_with_lock<T, F, Fut>(
        &self,
        key: &str,
        opts: &LockOptions,
        work: F,
    ) -> LockResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lock) = self.try_acquire(key, opts).await? else {
            return Ok(None);
        };
        let mut guard = ReleaseGuard {
            manager: self,
            lock: Some(lock),
        };
        let result = work().await;
        if let Some(lock) = guard.lock.take() {
            self.release(lock).await?;
        }
        Ok(Some(result))
    }

    /// Release every lock this manager still holds, each through the
    /// token-compared delete. Locks meanwhile expired and reacquired by
    /// another holder are left alone. Reserved for shutdown.
    pub fn release_all(&self) -> LockResult<u32> {
        let held: Vec<(String, String)> = lock_map(&self.held).drain().collect();
        let mut released = 0;
        for (key, token) in held {
            match self.store.compare_and_delete(&storage_key(&key), &token) {
                Ok(true) => released += 1,
                Ok(false) => debug!(key = %key, "lock already expired or reacquired, skipping"),
                Err(e) => warn!(key = %key, error = %e, "lock release failed during shutdown"),
            }
        }
        if released > 0 {
            info!(released, "released remaining locks");
        }
        Ok(released)
    }

    fn spawn_renewal(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        interval: Duration,
    ) -> watch::Sender<bool> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let on_lost = self.on_lost.clone();
        let held = self.held.clone();
        let key = key.to_string();
        let token = token.to_string();
        let storage_key = storage_key(&key);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match store.compare_and_set_ttl(&storage_key, &token, ttl) {
                            Ok(true) => debug!(key = %key, "lock renewed"),
                            Ok(false) => {
                                warn!(key = %key, "lock lost, stopping renewal");
                                {
                                    let mut held = lock_map(&held);
                                    if held.get(&key).is_some_and(|t| *t == token) {
                                        held.remove(&key);
                                    }
                                }
                                if let Some(ref cb) = on_lost {
                                    cb(key.clone()).await;
                                }
                                break;
                            }
                            Err(e) => {
                                warn!(key = %key, error = %e, "lock renewal failed");
                            }
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        stop_tx
    }
}

/// Releases the wrapped lock on drop, so `with_lock` bodies that panic
/// still give the lock up instead of holding it for the full TTL. The
/// happy path takes the lock back out and releases through the fallible
/// API.
struct ReleaseGuard<'a> {
    manager: &'a LockManager,
    lock: Option<Lock>,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            warn!(key = %lock.key, "releasing lock abandoned mid-critical-section");
            if let Err(e) = self.manager.release_inner(&mut lock) {
                warn!(key = %lock.key, error = %e, "lock release during unwind failed");
            }
        }
    }
}

const LOCK_PREFIX: &str = "lock:";

fn storage_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

fn lock_map(m: &Mutex<HashMap<String, String>>) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
