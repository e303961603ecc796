use std::future::Future;
use std::time::Duration;

use crossbus_core::{CrossBusError, Result};
use rand::Rng;
use tracing::debug;

/// Exponential backoff with jitter.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Jitter fraction applied symmetrically (±jitter_fraction), e.g. 0.25 for ±25%.
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    /// Preset: aggressive, short-lived retries for latency-sensitive calls.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(20),
            factor: 2.0,
            max_delay: Duration::from_millis(200),
            jitter_fraction: 0.25,
        }
    }

    /// Preset: the default choice for most request types.
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.25,
        }
    }

    /// Preset: many attempts, larger ceiling, for background/best-effort work.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            base: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }

    /// Preset: a single attempt, no retry at all.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base: Duration::from_millis(0),
            factor: 1.0,
            max_delay: Duration::from_millis(0),
            jitter_fraction: 0.0,
        }
    }

    /// `base * factor^attempt`, capped at `max_delay`, with ±`jitter_fraction` jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter_fraction > 0.0 {
            let spread = capped * self.jitter_fraction;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Observer invoked before each retry attempt (after the first failure).
pub type OnRetry = Box<dyn Fn(u32, &CrossBusError) + Send + Sync>;

/// Wraps an async request with the given retry policy: retries only errors
/// classified `retryable`, invoking an optional `on_retry` observer, and
/// never invoking the wrapped function more than `max_attempts` times.
pub async fn with_retry<F, Fut>(policy: RetryPolicy, mut f: F, on_retry: Option<OnRetry>) -> Result<serde_json::Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<serde_json::Value>>,
{
    let mut last_err: Option<CrossBusError> = None;
    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.retryable || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                if let Some(observer) = &on_retry {
                    observer(attempt + 1, &err);
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "retrying after retryable error");
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        CrossBusError::from_code(crossbus_core::ErrorCode::HandlerError, serde_json::json!({"reason": "retry exhausted with no attempts"}))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbus_core::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn invariant_9_bounds_attempts_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            factor: 1.0,
            max_delay: Duration::from_millis(5),
            jitter_fraction: 0.0,
        };
        let result = with_retry(
            policy,
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CrossBusError::from_code(ErrorCode::SendFailed, serde_json::json!({})))
                }
            },
            None,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_skip_retry_entirely() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = with_retry(
            RetryPolicy::standard(),
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CrossBusError::from_code(ErrorCode::NoHandler, serde_json::json!({})))
                }
            },
            None,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
