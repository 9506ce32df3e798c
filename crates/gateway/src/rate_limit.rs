//! Per-user leaky bucket.
//!
//! Enforced after auth resolution, so the key is the authenticated
//! `user_id` rather than a spoofable address. The optional per-IP
//! governor layer in front of the router handles pre-auth abuse.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use palaver_domain::config::UserRateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct UserRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    burst: f64,
    per_second: f64,
}

impl UserRateLimiter {
    pub fn new(cfg: &UserRateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            burst: f64::from(cfg.burst.max(1)),
            per_second: cfg.requests_per_second.max(0.01),
        }
    }

    /// Take one token for `user_id`; `false` means rate-limited.
    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(user_id.to_owned()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have fully refilled (idle users).
    pub fn sweep(&self) {
        let now = Instant::now();
        let burst = self.burst;
        let per_second = self.per_second;
        self.buckets.lock().retain(|_, b| {
            let refilled = b.tokens + now.duration_since(b.last_refill).as_secs_f64() * per_second;
            refilled < burst
        });
    }

    pub fn tracked_users(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, per_second: f64) -> UserRateLimiter {
        UserRateLimiter::new(&UserRateLimitConfig {
            burst,
            requests_per_second: per_second,
        })
    }

    #[test]
    fn burst_then_limited() {
        let limiter = limiter(3, 0.01);
        assert!(limiter.allow("u1"));
        assert!(limiter.allow("u1"));
        assert!(limiter.allow("u1"));
        assert!(!limiter.allow("u1"));
    }

    #[test]
    fn users_do_not_share_buckets() {
        let limiter = limiter(1, 0.01);
        assert!(limiter.allow("u1"));
        assert!(!limiter.allow("u1"));
        assert!(limiter.allow("u2"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = limiter(1, 1000.0);
        assert!(limiter.allow("u1"));
        assert!(!limiter.allow("u1"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.allow("u1"));
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let limiter = limiter(1, 1000.0);
        limiter.allow("u1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        limiter.sweep();
        assert_eq!(limiter.tracked_users(), 0);
    }
}
