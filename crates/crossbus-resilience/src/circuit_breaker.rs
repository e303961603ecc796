use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbus_core::{CrossBusError, ErrorCode, Result};
use tracing::info;

/// `closed → open → half-open → {closed, open}`; state only ever moves
/// forward along this graph, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct State {
    state: CircuitState,
    opened_at: Option<Instant>,
}

/// Observer invoked on every state transition.
pub type OnTransition = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    state: Mutex<State>,
    on_transition: Option<OnTransition>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout,
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            state: Mutex::new(State {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            on_transition: None,
        }
    }

    pub fn with_observer(mut self, observer: OnTransition) -> Self {
        self.on_transition = Some(observer);
        self
    }

    /// Current state. Lazily decays `open` to `half-open` on inspection once
    /// the reset timeout has elapsed, per §4.12 ("on next inspection").
    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock().unwrap();
        self.maybe_half_open(&mut guard);
        guard.state
    }

    fn transition(&self, guard: &mut State, to: CircuitState) {
        let from = guard.state;
        if from == to {
            return;
        }
        guard.state = to;
        if to == CircuitState::Open {
            guard.opened_at = Some(Instant::now());
        }
        info!(?from, ?to, "circuit breaker state transition");
        if let Some(observer) = &self.on_transition {
            observer(from, to);
        }
    }

    /// Inspects whether `open` should decay to `half-open` now that the
    /// reset timeout has elapsed. Called lazily on each `execute`.
    fn maybe_half_open(&self, guard: &mut State) {
        if guard.state == CircuitState::Open {
            if let Some(opened_at) = guard.opened_at {
                if opened_at.elapsed() >= self.reset_timeout {
                    self.transition(guard, CircuitState::HalfOpen);
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    /// Executes `f`, tracking failures/successes to drive the state
    /// machine. Throws `CircuitOpen` without invoking `f` when open.
    pub async fn execute<F, Fut>(&self, f: F) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        {
            let mut guard = self.state.lock().unwrap();
            self.maybe_half_open(&mut guard);
            if guard.state == CircuitState::Open {
                return Err(CrossBusError::from_code(ErrorCode::CircuitOpen, serde_json::json!({})));
            }
        }

        match f().await {
            Ok(value) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let mut guard = self.state.lock().unwrap();
                if guard.state == CircuitState::HalfOpen {
                    let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                    if successes >= self.success_threshold {
                        self.transition(&mut guard, CircuitState::Closed);
                    }
                }
                Ok(value)
            }
            Err(err) => {
                let mut guard = self.state.lock().unwrap();
                if guard.state == CircuitState::HalfOpen {
                    // First failure in half-open reopens immediately.
                    self.transition(&mut guard, CircuitState::Open);
                } else {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.failure_threshold {
                        self.transition(&mut guard, CircuitState::Open);
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;

    #[tokio::test]
    async fn scenario_s4_opens_after_failure_threshold_then_half_opens() {
        let breaker = CircuitBreaker::new(2, 1, Duration::from_millis(40));
        let calls = Arc::new(Counter::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = breaker
                .execute(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CrossBusError::from_code(ErrorCode::SendFailed, serde_json::json!({})))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls3 = calls.clone();
        let result = breaker
            .execute(move || async move {
                calls3.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!(null))
            })
            .await;
        assert_eq!(result.unwrap_err().code, ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "breaker must not invoke f while open");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_threshold_closes_the_breaker() {
        let breaker = CircuitBreaker::new(1, 2, Duration::from_millis(10));
        let _ = breaker
            .execute(|| async { Err(CrossBusError::from_code(ErrorCode::SendFailed, serde_json::json!({}))) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker.execute(|| async { Ok(serde_json::json!(null)) }).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let _ = breaker.execute(|| async { Ok(serde_json::json!(null)) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(1, 3, Duration::from_millis(10));
        let _ = breaker
            .execute(|| async { Err(CrossBusError::from_code(ErrorCode::SendFailed, serde_json::json!({}))) })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = breaker
            .execute(|| async { Err(CrossBusError::from_code(ErrorCode::SendFailed, serde_json::json!({}))) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
