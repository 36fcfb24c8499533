// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for outbound endpoints.
//!
//! The circuit breaker prevents cascading failures by temporarily stopping
//! requests to failing endpoints and allowing them to recover.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests immediately fail (endpoint is down)
//! - **Half-Open**: A limited number of trial calls test if the endpoint recovered
//!
//! Every state change starts a new generation. A call admitted in an earlier
//! generation does not count towards the current one.
//!
//! # Example
//!
//! ```
//! use chat_infra::runtime::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(6)
//!     .with_reset_timeout(Duration::from_secs(60));
//!
//! let breaker = CircuitBreaker::new("EchoService.Echo", config);
//! let result = breaker.call(|| async { Ok::<_, chat_infra::InfraError>(42) }).await;
//! assert_eq!(result.unwrap(), 42);
//! # });
//! ```

use crate::config::EndpointConfig;
use crate::error::{InfraError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, testing if service has recovered.
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures that opens the circuit.
    pub failure_threshold: usize,
    /// Number of consecutive successes in half-open state before closing.
    pub success_threshold: usize,
    /// Duration to wait before transitioning from open to half-open.
    pub reset_timeout: Duration,
    /// Maximum number of requests allowed in half-open state.
    pub half_open_max_requests: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 6,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the endpoint breaker settings.
    #[must_use]
    pub fn from_endpoint(config: &EndpointConfig) -> Self {
        Self::default()
            .with_failure_threshold(config.breaker_failure_threshold)
            .with_reset_timeout(config.breaker_timeout)
            .with_half_open_max_requests(config.breaker_half_open_max_requests)
            .with_success_threshold(config.breaker_half_open_max_requests)
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold for recovery.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the maximum half-open requests.
    #[must_use]
    pub fn with_half_open_max_requests(mut self, max: usize) -> Self {
        self.half_open_max_requests = max.max(1);
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    consecutive_failures: usize,
    consecutive_successes: usize,
    half_open_requests: usize,
    opened_at: Option<Instant>,
}

/// Circuit breaker for protecting against cascading failures.
///
/// The circuit breaker tracks consecutive failures and opens the circuit when
/// the failure threshold is reached, rejecting further requests until the
/// reset timeout has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_requests: 0,
                opened_at: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner)
    }

    /// Check if the circuit allows requests.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match self.refresh(&mut inner) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_requests < self.config.half_open_max_requests,
        }
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `InfraError::CircuitOpen` if the circuit is open and
    /// `InfraError::TooManyRequests` if the half-open trial calls are in use.
    /// Returns the operation's error if it fails.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let admission = match self.before_call() {
            Ok(generation) => Admission {
                breaker: self,
                generation,
                settled: false,
            },
            Err(e) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let result = operation().await;
        admission.settle(result.is_ok());
        result
    }

    fn before_call(&self) -> Result<u64> {
        let mut inner = self.lock();
        match self.refresh(&mut inner) {
            CircuitState::Closed => Ok(inner.generation),
            CircuitState::Open => {
                let remaining = inner
                    .opened_at
                    .map(|at| self.config.reset_timeout.saturating_sub(at.elapsed()))
                    .unwrap_or_default();
                Err(InfraError::CircuitOpen(format!(
                    "{}, will retry after {:?}",
                    self.name, remaining
                )))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests >= self.config.half_open_max_requests {
                    return Err(InfraError::TooManyRequests(self.name.clone()));
                }
                inner.half_open_requests += 1;
                Ok(inner.generation)
            }
        }
    }

    fn after_call(&self, generation: u64, success: bool) {
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.lock();
        let state = self.refresh(&mut inner);
        if generation != inner.generation {
            return;
        }

        match (state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, false) => {
                // Any failure in half-open state reopens the circuit
                self.transition(&mut inner, CircuitState::Open);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn refresh(&self, inner: &mut BreakerState) -> CircuitState {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    self.transition(inner, CircuitState::HalfOpen);
                }
            }
        }
        inner.state
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_requests = 0;
        inner.opened_at = (to == CircuitState::Open).then(Instant::now);

        tracing::info!(breaker = %self.name, ?from, ?to, "circuit breaker state changed");
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
    }

    /// Get the time until the circuit can retry (if open).
    pub fn time_until_retry(&self) -> Option<Duration> {
        let mut inner = self.lock();
        if self.refresh(&mut inner) != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|opened| self.config.reset_timeout.saturating_sub(opened.elapsed()))
    }

    /// Name of the guarded endpoint.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().consecutive_failures
    }

    /// Get total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of failures.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of rejections (circuit open).
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// An admitted call. Dropping it unsettled, as happens when the caller
/// abandons the call future, counts as a failure and frees its half-open slot.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name, "call dropped before completion");
            self.breaker.after_call(self.generation, false);
        }
    }
}

/// Breakers shared by name, one per remote `service.method`.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered under `name`, creating it with `config`
    /// on first use.
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
