//! Coordination primitives shared by the feed, pipeline and execution layers:
//! injected clock, circuit breaker, retry combinators and shutdown handling.

pub mod circuit_breaker;
pub mod clock;
pub mod retry;
pub mod shutdown;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use retry::{poll_until, retry_with_backoff, DeadlineExceeded, RetryPolicy};
pub use shutdown::{
    ShutdownConfig, ShutdownController, ShutdownPhase, ShutdownReason, ShutdownSignal,
};
