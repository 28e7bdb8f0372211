//! Rate limiting (`spec.md` §4.5, §4.6, §8 scenario 7).
//!
//! The real rate limiter and its statistics are external collaborators;
//! this is a minimal per-tunnel fixed-window adapter sufficient to drive
//! the `rate_limited` (429) path.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use uuid::Uuid;

pub trait RateLimiter: Send + Sync {
    /// Returns `true` if the request should be admitted.
    fn check(&self, tunnel_id: Uuid, per_minute: u32, per_day: u32) -> bool;
}

struct Window {
    minute_bucket: AtomicI64,
    minute_count: AtomicU32,
    day_bucket: AtomicI64,
    day_count: AtomicU32,
}

/// Fixed-window per-tunnel rate limiter: one counter that resets every 60
/// seconds, one that resets every 86400 seconds.
pub struct TokenBucketRateLimiter {
    windows: DashMap<Uuid, Window>,
}

impl TokenBucketRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }
}

impl Default for TokenBucketRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl RateLimiter for TokenBucketRateLimiter {
    fn check(&self, tunnel_id: Uuid, per_minute: u32, per_day: u32) -> bool {
        if per_minute == 0 && per_day == 0 {
            return true; // unmetered
        }
        let now = now_secs();
        let minute_bucket = now / 60;
        let day_bucket = now / 86400;

        let entry = self.windows.entry(tunnel_id).or_insert_with(|| Window {
            minute_bucket: AtomicI64::new(minute_bucket),
            minute_count: AtomicU32::new(0),
            day_bucket: AtomicI64::new(day_bucket),
            day_count: AtomicU32::new(0),
        });

        if entry.minute_bucket.swap(minute_bucket, Ordering::SeqCst) != minute_bucket {
            entry.minute_count.store(0, Ordering::SeqCst);
        }
        if entry.day_bucket.swap(day_bucket, Ordering::SeqCst) != day_bucket {
            entry.day_count.store(0, Ordering::SeqCst);
        }

        let minute_count = entry.minute_count.fetch_add(1, Ordering::SeqCst) + 1;
        let day_count = entry.day_count.fetch_add(1, Ordering::SeqCst) + 1;

        if per_minute != 0 && minute_count > per_minute {
            return false;
        }
        if per_day != 0 && day_count > per_day {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_per_minute_quota_then_denies() {
        let limiter = TokenBucketRateLimiter::new();
        let id = Uuid::new_v4();
        assert!(limiter.check(id, 1, 0));
        assert!(!limiter.check(id, 1, 0), "second request in the same minute must be denied");
    }

    #[test]
    fn zero_quota_means_unmetered() {
        let limiter = TokenBucketRateLimiter::new();
        let id = Uuid::new_v4();
        for _ in 0..100 {
            assert!(limiter.check(id, 0, 0));
        }
    }
}
