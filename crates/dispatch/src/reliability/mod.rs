//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Attempt budget and hold between retries
//! - [`CircuitBreaker`] - Failure isolation around a flaky dependency
//! - [`CircuitBreakerRegistry`] - Breakers by dependency name

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitCallError, CircuitListener, CircuitPermit, CircuitState,
};
pub use retry::RetryPolicy;
