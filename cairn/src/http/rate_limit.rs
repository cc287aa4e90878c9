//! Fixed-window request limiting.
//!
//! One limiter per policy (upload-start, fetch), each with its own quota
//! and window. Keys are chosen by the caller: the client address for
//! upload-start, `(address, store, path)` for fetch.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    count: u64,
    window_start: Instant,
}

pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a request under `key`, returning whether it is within
    /// quota.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limit lock poisoned");
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= self.max_requests {
            false
        } else {
            bucket.count += 1;
            true
        }
    }

    /// Drops buckets whose window has lapsed; called from the maintenance
    /// tick so idle keys do not accumulate.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .expect("rate limit lock poisoned")
            .retain(|_, bucket| now.duration_since(bucket.window_start) < self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_quota_per_key() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn window_resets() {
        let limiter = RateLimiter::new(1, Duration::ZERO);
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
    }

    #[test]
    fn sweep_drops_lapsed_buckets() {
        let limiter = RateLimiter::new(1, Duration::ZERO);
        limiter.check("a");
        limiter.sweep();
        assert!(limiter.buckets.lock().unwrap().is_empty());
    }
}
