//! In-flight connection tracking.
//!
//! Request paths hold a [`ConnectionGuard`] for the life of each
//! connection; the drain stage waits for the count to hit zero with a
//! bounded timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared in-flight connection counter.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection for the guard's lifetime.
    pub fn track(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no connections remain, up to `timeout`. Returns false
    /// if connections were still open when the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

/// RAII handle for one in-flight connection.
pub struct ConnectionGuard {
    active: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_count_and_release() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active(), 0);

        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.active(), 2);

        drop(a);
        assert_eq!(tracker.active(), 1);
        drop(b);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_drain(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn drain_times_out_with_open_connections() {
        let tracker = ConnectionTracker::new();
        let _held = tracker.track();
        assert!(!tracker.wait_for_drain(Duration::from_millis(80)).await);
        assert_eq!(tracker.active(), 1);
    }
}
