// Token-bucket guard for the registration endpoint, keyed by client
// address.
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 10,
            burst: 5,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str, config: RateLimitConfig) -> bool {
        if config.per_minute == 0 {
            return true;
        }
        let capacity = config.burst.max(1) as f64;
        let refill_per_sec = config.per_minute as f64 / 60.0;
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let state = match buckets.entry(key.to_string()) {
            Entry::Vacant(entry) => entry.insert(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            Entry::Occupied(entry) => entry.into_mut(),
        };
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_per_sec).min(capacity);
        state.last_refill = now;
        if state.tokens < 1.0 {
            return false;
        }
        state.tokens -= 1.0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_allowed_then_throttled() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            per_minute: 60,
            burst: 3,
        };
        assert!(limiter.acquire("1.2.3.4", config));
        assert!(limiter.acquire("1.2.3.4", config));
        assert!(limiter.acquire("1.2.3.4", config));
        assert!(!limiter.acquire("1.2.3.4", config));
        // Other keys are unaffected.
        assert!(limiter.acquire("5.6.7.8", config));
    }

    #[test]
    fn zero_rate_disables_the_limiter() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            per_minute: 0,
            burst: 0,
        };
        for _ in 0..100 {
            assert!(limiter.acquire("anyone", config));
        }
    }
}
