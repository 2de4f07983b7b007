//! Per-address sliding-window rate limiting.
//!
//! Auth methods are limited per remote address (default 60/min). Expired
//! hits are pruned whenever a bucket is touched and the bucket map itself
//! is LRU-capped, so it cannot grow without bound.

use crate::error::{Error, Result};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Maximum number of tracked remote addresses.
const MAX_BUCKETS: usize = 4096;

/// Sliding-window limiter keyed by remote address.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    buckets: Mutex<LruCache<String, Vec<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_per_window` hits per `window`.
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_BUCKETS).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_per_window,
            window,
            buckets: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Record a hit for `addr`, failing with [`Error::RateLimited`] when
    /// the window is full.
    pub fn check(&self, addr: &str) -> Result<()> {
        self.check_at(addr, Instant::now())
    }

    fn check_at(&self, addr: &str, now: Instant) -> Result<()> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if buckets.get(addr).is_none() {
            buckets.put(addr.to_string(), Vec::new());
        }
        let Some(hits) = buckets.get_mut(addr) else {
            return Ok(());
        };

        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() >= self.max_per_window {
            return Err(Error::RateLimited);
        }
        hits.push(now);
        Ok(())
    }

    /// Number of tracked addresses (for introspection/tests).
    pub fn tracked_addresses(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        let now = Instant::now();

        for _ in 0..60 {
            limiter.check_at("10.0.0.1:5000", now).expect("within limit");
        }
        assert!(matches!(
            limiter.check_at("10.0.0.1:5000", now),
            Err(Error::RateLimited)
        ));
    }

    #[test]
    fn test_addresses_are_independent() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();

        limiter.check_at("a", now).expect("ok");
        limiter.check_at("a", now).expect("ok");
        assert!(limiter.check_at("a", now).is_err());

        limiter.check_at("b", now).expect("other address unaffected");
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        limiter.check_at("a", start).expect("ok");
        limiter.check_at("a", start).expect("ok");
        assert!(limiter.check_at("a", start).is_err());

        // Past the window the old hits no longer count.
        let later = start + Duration::from_secs(61);
        limiter.check_at("a", later).expect("window expired");
    }

    #[test]
    fn test_bucket_count_is_bounded() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        for i in 0..(MAX_BUCKETS + 100) {
            let _ = limiter.check_at(&format!("addr-{}", i), now);
        }
        assert!(limiter.tracked_addresses() <= MAX_BUCKETS);
    }
}
