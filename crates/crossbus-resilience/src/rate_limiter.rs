use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbus_core::{CrossBusError, ErrorCode, Result};

/// Shared options for a family of per-peer token-bucket limiters.
#[derive(Clone, Copy)]
pub struct RateLimiterOptions {
    pub max_requests: u32,
    pub window: Duration,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: capacity `max_requests`, refilled proportionally to
/// elapsed time over `window` (fully refilled on a window boundary).
pub struct RateLimiter {
    options: RateLimiterOptions,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            options,
            bucket: Mutex::new(Bucket {
                tokens: options.max_requests as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        if elapsed >= self.options.window {
            bucket.tokens = self.options.max_requests as f64;
        } else {
            let refill_rate = self.options.max_requests as f64 / self.options.window.as_secs_f64();
            bucket.tokens = (bucket.tokens + refill_rate * elapsed.as_secs_f64()).min(self.options.max_requests as f64);
        }
        bucket.last_refill = Instant::now();
    }

    /// Consumes one token if available. Returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until the next token becomes available — never earlier
    /// than the next refill tick.
    pub fn retry_after(&self) -> Duration {
        let bucket = self.bucket.lock().unwrap();
        if bucket.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let refill_rate = self.options.max_requests as f64 / self.options.window.as_secs_f64();
        if refill_rate <= 0.0 {
            return self.options.window;
        }
        let tokens_needed = 1.0 - bucket.tokens;
        Duration::from_secs_f64(tokens_needed / refill_rate)
    }

    /// As a hook: raises `RateLimited` rather than silently dropping, so the
    /// caller can branch on an explicit error, matching the rest of the hook
    /// surface where failures are explicit.
    pub fn check(&self) -> Result<()> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(CrossBusError::with_message(
                ErrorCode::RateLimited,
                "rate limit exceeded",
                serde_json::json!({"retryAfterMs": self.retry_after().as_millis() as u64}),
            ))
        }
    }
}

/// Per-peer limiters sharing one set of options.
pub struct PerPeerRateLimiter {
    options: RateLimiterOptions,
    limiters: Mutex<HashMap<String, Mutex<Bucket>>>,
}

impl PerPeerRateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            options,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, peer: &str) -> Result<()> {
        let mut limiters = self.limiters.lock().unwrap();
        let bucket_lock = limiters.entry(peer.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.options.max_requests as f64,
                last_refill: Instant::now(),
            })
        });
        let mut bucket = bucket_lock.lock().unwrap();
        let elapsed = bucket.last_refill.elapsed();
        if elapsed >= self.options.window {
            bucket.tokens = self.options.max_requests as f64;
        } else {
            let refill_rate = self.options.max_requests as f64 / self.options.window.as_secs_f64();
            bucket.tokens = (bucket.tokens + refill_rate * elapsed.as_secs_f64()).min(self.options.max_requests as f64);
        }
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(CrossBusError::from_code(ErrorCode::RateLimited, serde_json::json!({"peer": peer})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_respects_capacity_then_refills_over_the_window() {
        let limiter = RateLimiter::new(RateLimiterOptions {
            max_requests: 2,
            window: Duration::from_millis(50),
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn retry_after_is_zero_when_tokens_are_available() {
        let limiter = RateLimiter::new(RateLimiterOptions {
            max_requests: 1,
            window: Duration::from_millis(50),
        });
        assert_eq!(limiter.retry_after(), Duration::ZERO);
    }

    #[test]
    fn per_peer_limiters_do_not_share_buckets() {
        let limiter = PerPeerRateLimiter::new(RateLimiterOptions {
            max_requests: 1,
            window: Duration::from_millis(50),
        });
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }
}
