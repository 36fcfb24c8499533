// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime utilities for resilience and observability.
//!
//! Retry policies and circuit breakers shared by the client and endpoints,
//! Prometheus metrics and trace context propagation shared by the server and
//! the client.

mod circuit_breaker;
pub mod metrics;
mod retry;
pub mod tracing;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use metrics::{Exemplar, MethodInfo, MethodKind, ServerMetrics};
pub use retry::{
    AsGrpcStatus, BackoffStrategy, LinearJitterBackoff, NoBackoff, NoRetryPolicy, RetryConfig,
    RetryConfigBuilder, RetryPolicy, TransientRetryPolicy,
};
