//! Failsafe mechanisms for upstream provider calls: bounded retry and circuit breaking

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use retry::{RetryPolicy, with_retry};
