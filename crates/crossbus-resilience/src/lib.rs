//! Resilience plugins layered on top of `crossbus-core`'s bus facade:
//! retry with backoff, circuit breaker, rate limiting, backpressure,
//! batching, payload versioning, and schema validation. Each plugin is a
//! small, independently usable type that composes with the core hook
//! pipeline rather than a bus subclass.

mod backpressure;
mod batching;
mod circuit_breaker;
mod rate_limiter;
mod retry;
mod schema;
mod versioning;

pub use backpressure::{Backpressure, OverflowPolicy, QueueStats};
pub use batching::{expand_batch_hook, Batcher};
pub use circuit_breaker::{CircuitBreaker, CircuitState, OnTransition};
pub use rate_limiter::{PerPeerRateLimiter, RateLimiter, RateLimiterOptions};
pub use retry::{with_retry, OnRetry, RetryPolicy};
pub use schema::{validate, Schema, SchemaType};
pub use versioning::{Migrator, Versioning};
