// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and backoff strategies for outbound RPC calls.
//!
//! The client retries only transient codes, makes at most three attempts
//! and waits roughly one second between them. Each attempt may be capped by
//! its own deadline; an attempt that runs out of time is retried like a
//! transient failure while attempts remain.
//!
//! # Example
//!
//! ```
//! use chat_infra::runtime::{LinearJitterBackoff, RetryConfig, TransientRetryPolicy};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_attempts(3)
//!     .policy(TransientRetryPolicy)
//!     .backoff(LinearJitterBackoff::new(Duration::from_secs(1), 0.1))
//!     .per_attempt_timeout(Duration::from_secs(3))
//!     .build();
//! assert_eq!(retry.max_attempts, 3);
//! ```

use crate::config::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Calculate the delay before the next retry attempt.
    ///
    /// # Arguments
    /// * `attempt` - The number of attempts made so far (1 before the first retry)
    fn delay(&self, attempt: u32) -> Duration;
}

// =============================================================================
// No Backoff
// =============================================================================

/// No delay between retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl NoBackoff {
    /// Create a new no-backoff strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

// =============================================================================
// Linear Backoff With Jitter
// =============================================================================

/// Constant wait perturbed by a random jitter.
///
/// Every delay is drawn uniformly from `wait * (1 - jitter) ..= wait * (1 + jitter)`,
/// independent of the attempt number.
#[derive(Debug, Clone, Copy)]
pub struct LinearJitterBackoff {
    wait: Duration,
    jitter: f64,
}

impl LinearJitterBackoff {
    /// Create a new backoff around `wait`; `jitter` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(wait: Duration, jitter: f64) -> Self {
        Self {
            wait,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Smallest delay this strategy can produce.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        self.wait.mul_f64(1.0 - self.jitter)
    }

    /// Largest delay this strategy can produce.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.wait.mul_f64(1.0 + self.jitter)
    }
}

impl Default for LinearJitterBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 0.1)
    }
}

impl BackoffStrategy for LinearJitterBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        let r: f64 = rand::random();
        let factor = 1.0 + self.jitter * (2.0 * r - 1.0);
        self.wait.mul_f64(factor)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Determines whether a gRPC error should be retried.
pub trait RetryPolicy: Clone + Send + Sync + 'static {
    /// Returns `true` if the operation should be retried for this error.
    fn should_retry(&self, code: tonic::Code) -> bool;
}

/// Retries `Unavailable` and `Aborted` only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientRetryPolicy;

impl RetryPolicy for TransientRetryPolicy {
    fn should_retry(&self, code: tonic::Code) -> bool {
        matches!(code, tonic::Code::Unavailable | tonic::Code::Aborted)
    }
}

/// Never retry - fail immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _code: tonic::Code) -> bool {
        false
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Complete retry configuration combining policy and backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig<
    P: RetryPolicy = TransientRetryPolicy,
    B: BackoffStrategy = LinearJitterBackoff,
> {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Policy determining which errors to retry.
    pub policy: P,
    /// Backoff strategy for calculating delays.
    pub backoff: B,
    /// Deadline of a single attempt.
    pub per_attempt_timeout: Option<Duration>,
    /// Maximum total time for all attempts.
    pub total_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            policy: TransientRetryPolicy,
            backoff: LinearJitterBackoff::default(),
            per_attempt_timeout: Some(Duration::from_secs(3)),
            total_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder<TransientRetryPolicy, LinearJitterBackoff> {
        RetryConfigBuilder::new()
    }

    /// Build the client retry configuration from settings.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            policy: TransientRetryPolicy,
            backoff: LinearJitterBackoff::new(settings.backoff, settings.jitter),
            per_attempt_timeout: Some(settings.per_attempt_timeout),
            total_timeout: None,
        }
    }

    /// Disable retries.
    #[must_use]
    pub fn disabled() -> RetryConfig<NoRetryPolicy, NoBackoff> {
        RetryConfig {
            max_attempts: 1,
            policy: NoRetryPolicy,
            backoff: NoBackoff,
            per_attempt_timeout: None,
            total_timeout: None,
        }
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfig<P, B> {
    /// Execute an async operation with retry logic.
    ///
    /// The last error is returned once the policy refuses it, the attempts
    /// are used up, or the total timeout has elapsed.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AsGrpcStatus + From<tonic::Status>,
    {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (err, timed_out) = match self.per_attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(Ok(result)) => return Ok(result),
                    Ok(Err(e)) => (e, false),
                    Err(_) => (
                        E::from(tonic::Status::deadline_exceeded(format!(
                            "attempt {} exceeded its {:?} deadline",
                            attempt, limit
                        ))),
                        true,
                    ),
                },
                None => match operation().await {
                    Ok(result) => return Ok(result),
                    Err(e) => (e, false),
                },
            };

            let code = err.grpc_code();

            // Check if we should retry
            if !timed_out && !self.policy.should_retry(code) {
                return Err(err);
            }

            // Check if we've used up our attempts
            if attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = self.backoff.delay(attempt);

            // Check total timeout
            if let Some(timeout) = self.total_timeout {
                if start.elapsed() + delay >= timeout {
                    return Err(err);
                }
            }

            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                code = ?code,
                delay_ms = delay.as_millis() as u64,
                "retrying call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder<P: RetryPolicy, B: BackoffStrategy> {
    max_attempts: u32,
    policy: P,
    backoff: B,
    per_attempt_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
}

impl RetryConfigBuilder<TransientRetryPolicy, LinearJitterBackoff> {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            policy: defaults.policy,
            backoff: defaults.backoff,
            per_attempt_timeout: defaults.per_attempt_timeout,
            total_timeout: defaults.total_timeout,
        }
    }
}

impl Default for RetryConfigBuilder<TransientRetryPolicy, LinearJitterBackoff> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfigBuilder<P, B> {
    /// Set the maximum number of attempts (at least one).
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn policy<P2: RetryPolicy>(self, policy: P2) -> RetryConfigBuilder<P2, B> {
        RetryConfigBuilder {
            max_attempts: self.max_attempts,
            policy,
            backoff: self.backoff,
            per_attempt_timeout: self.per_attempt_timeout,
            total_timeout: self.total_timeout,
        }
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff<B2: BackoffStrategy>(self, backoff: B2) -> RetryConfigBuilder<P, B2> {
        RetryConfigBuilder {
            max_attempts: self.max_attempts,
            policy: self.policy,
            backoff,
            per_attempt_timeout: self.per_attempt_timeout,
            total_timeout: self.total_timeout,
        }
    }

    /// Cap each attempt at `timeout`.
    #[must_use]
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    /// Let attempts run until they finish on their own.
    #[must_use]
    pub fn no_per_attempt_timeout(mut self) -> Self {
        self.per_attempt_timeout = None;
        self
    }

    /// Set the total timeout for all attempts.
    #[must_use]
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RetryConfig<P, B> {
        RetryConfig {
            max_attempts: self.max_attempts,
            policy: self.policy,
            backoff: self.backoff,
            per_attempt_timeout: self.per_attempt_timeout,
            total_timeout: self.total_timeout,
        }
    }
}

/// Trait for extracting gRPC status codes from errors.
pub trait AsGrpcStatus {
    /// Extract the gRPC status code.
    fn grpc_code(&self) -> tonic::Code;
}

impl AsGrpcStatus for tonic::Status {
    fn grpc_code(&self) -> tonic::Code {
        self.code()
    }
}

impl AsGrpcStatus for crate::error::InfraError {
    fn grpc_code(&self) -> tonic::Code {
        self.to_status().code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    type Attempt = std::pin::Pin<Box<dyn Future<Output = Result<i32, tonic::Status>> + Send>>;

    fn counting_op(
        count: &Arc<AtomicU32>,
        fail_times: u32,
        status: fn() -> tonic::Status,
    ) -> impl FnMut() -> Attempt {
        let count = count.clone();
        move || {
            let count = count.clone();
            let attempt: Attempt = Box::pin(async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err(status())
                } else {
                    Ok(42)
                }
            });
            attempt
        }
    }

    #[test]
    fn test_no_backoff() {
        let backoff = NoBackoff::new();
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(5), Duration::ZERO);
    }

    #[test]
    fn test_linear_jitter_backoff_bounds() {
        let backoff = LinearJitterBackoff::default();
        assert_eq!(backoff.min_delay(), Duration::from_millis(900));
        assert_eq!(backoff.max_delay(), Duration::from_millis(1100));

        for attempt in 0..200 {
            let delay = backoff.delay(attempt);
            assert!(delay >= backoff.min_delay(), "{:?} too short", delay);
            assert!(delay <= backoff.max_delay(), "{:?} too long", delay);
        }
    }

    #[test]
    fn test_linear_jitter_backoff_clamps_jitter() {
        let backoff = LinearJitterBackoff::new(Duration::from_millis(100), 3.0);
        assert_eq!(backoff.min_delay(), Duration::ZERO);
        assert_eq!(backoff.max_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_transient_retry_policy() {
        let policy = TransientRetryPolicy;

        assert!(policy.should_retry(tonic::Code::Unavailable));
        assert!(policy.should_retry(tonic::Code::Aborted));

        assert!(!policy.should_retry(tonic::Code::DeadlineExceeded));
        assert!(!policy.should_retry(tonic::Code::ResourceExhausted));
        assert!(!policy.should_retry(tonic::Code::PermissionDenied));
        assert!(!policy.should_retry(tonic::Code::Internal));
        assert!(!policy.should_retry(tonic::Code::Unknown));
    }

    #[test]
    fn test_retry_config_from_settings() {
        let config = RetryConfig::from_settings(&RetrySettings::default());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.per_attempt_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.backoff.min_delay(), Duration::from_millis(900));
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::builder()
            .max_attempts(0)
            .backoff(NoBackoff::new())
            .total_timeout(Duration::from_secs(60))
            .no_per_attempt_timeout()
            .build();

        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.total_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.per_attempt_timeout, None);
    }

    #[tokio::test]
    async fn test_retry_execute_success() {
        let config = RetryConfig::default();

        let result: Result<i32, tonic::Status> = config.execute(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_execute_transient_failure() {
        let config = RetryConfig::builder().backoff(NoBackoff::new()).build();
        let count = Arc::new(AtomicU32::new(0));

        let result = config
            .execute(counting_op(&count, 2, || tonic::Status::aborted("conflict")))
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_execute_gives_up_after_max_attempts() {
        let config = RetryConfig::builder().backoff(NoBackoff::new()).build();
        let count = Arc::new(AtomicU32::new(0));

        let result = config
            .execute(counting_op(&count, 10, || {
                tonic::Status::unavailable("down")
            }))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::Unavailable);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_execute_permanent_failure() {
        let config = RetryConfig::builder().backoff(NoBackoff::new()).build();
        let count = Arc::new(AtomicU32::new(0));

        let result = config
            .execute(counting_op(&count, 10, || {
                tonic::Status::permission_denied("no")
            }))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::PermissionDenied);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let config = RetryConfig::default();
        let count = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = config
            .execute(counting_op(&count, 1, || {
                tonic::Status::unavailable("down")
            }))
            .await;

        let elapsed = start.elapsed();
        assert_eq!(result.unwrap(), 42);
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_is_retried() {
        let config = RetryConfig::builder()
            .backoff(NoBackoff::new())
            .per_attempt_timeout(Duration::from_millis(50))
            .build();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();

        let result: Result<i32, tonic::Status> = config
            .execute(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_surfaces_deadline_exceeded() {
        let config = RetryConfig::builder()
            .max_attempts(2)
            .backoff(NoBackoff::new())
            .per_attempt_timeout(Duration::from_millis(50))
            .build();

        let result: Result<(), tonic::Status> = config
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_timeout_stops_retrying() {
        let config = RetryConfig::builder()
            .max_attempts(10)
            .total_timeout(Duration::from_millis(1500))
            .build();
        let count = Arc::new(AtomicU32::new(0));

        let result = config
            .execute(counting_op(&count, 10, || {
                tonic::Status::unavailable("down")
            }))
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
