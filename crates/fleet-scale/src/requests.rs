//! Rolling request-rate counter.
//!
//! Counts requests in a fixed window (60s by default) and reports the
//! rate over the elapsed portion; the window resets once it is full.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Window {
    count: u64,
    started: Instant,
}

/// Shared request counter; clone freely and record from request paths.
#[derive(Clone)]
pub struct RequestCounter {
    window: Duration,
    inner: Arc<Mutex<Window>>,
}

impl RequestCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Arc::new(Mutex::new(Window {
                count: 0,
                started: Instant::now(),
            })),
        }
    }

    /// Record `n` handled requests.
    pub fn record(&self, n: u64) {
        let mut w = self.lock();
        self.roll(&mut w);
        w.count += n;
    }

    /// Requests per second over the current window.
    pub fn rate_per_sec(&self) -> f64 {
        let mut w = self.lock();
        self.roll(&mut w);
        let elapsed = w.started.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        w.count as f64 / elapsed
    }

    fn roll(&self, w: &mut Window) {
        if w.started.elapsed() >= self.window {
            w.count = 0;
            w.started = Instant::now();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_reflects_recorded_requests() {
        let counter = RequestCounter::new(Duration::from_secs(60));
        counter.record(100);
        std::thread::sleep(Duration::from_millis(100));

        let rate = counter.rate_per_sec();
        // 100 requests over ~0.1s.
        assert!(rate > 100.0);
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let counter = RequestCounter::new(Duration::from_millis(50));
        counter.record(1000);
        std::thread::sleep(Duration::from_millis(80));

        counter.record(1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(counter.rate_per_sec() < 100.0);
    }

    #[test]
    fn empty_counter_rates_zero() {
        let counter = RequestCounter::default();
        assert_eq!(counter.rate_per_sec(), 0.0);
    }
}
