// SPDX-License-Identifier: MIT OR Apache-2.0

//! Callable endpoints for one remote method.
//!
//! An endpoint built by [`EndpointFactory`] layers, innermost first:
//!
//! 1. the [`ClientConn`] call with its transient-code retry,
//! 2. the `service-id` header naming the calling service,
//! 3. a circuit breaker named `<service>.<method>`,
//! 4. a [`CallBudget`] of one attempt within 15 seconds.
//!
//! # Example
//!
//! ```no_run
//! use chat_infra::client::{EndpointFactory, RpcClientBuilder};
//! use chat_infra::config::EndpointConfig;
//! use chat_infra::testkit::{EchoReply, EchoRequest};
//!
//! # async fn example() -> chat_infra::error::Result<()> {
//! let conn = RpcClientBuilder::new().dial("room-service:50051")?;
//! let factory = EndpointFactory::new("gateway", &EndpointConfig::default())?;
//!
//! let echo = factory.make_endpoint::<EchoRequest, EchoReply>(&conn, "echo.EchoService", "Echo")?;
//! let reply = echo.call(EchoRequest::new("hello")).await?;
//! # Ok(())
//! # }
//! ```

use super::ClientConn;
use crate::config::EndpointConfig;
use crate::error::{InfraError, Result};
use crate::runtime::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::metadata::{Ascii, MetadataMap, MetadataValue};
use tonic::{Request, Response};

/// Metadata key identifying the calling service.
pub const SERVICE_ID_HEADER: &str = "service-id";

/// Attempt and wall-clock budget wrapped around a breaker-guarded call.
///
/// Any error is retried while attempts and time remain; running out of time
/// ends the call with [`InfraError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBudget {
    max_attempts: u32,
    timeout: Duration,
}

impl Default for CallBudget {
    fn default() -> Self {
        Self::from_endpoint(&EndpointConfig::default())
    }
}

impl CallBudget {
    #[must_use]
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    #[must_use]
    pub fn from_endpoint(config: &EndpointConfig) -> Self {
        Self::new(config.retry_max_attempts, config.retry_timeout)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation` within the budget. The last error is returned once
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout_at(deadline, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => return Err(InfraError::Timeout(self.timeout)),
            };
            if attempt >= self.max_attempts || Instant::now() >= deadline {
                return Err(err);
            }
            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "retrying endpoint call"
            );
        }
    }
}

/// Builds [`GrpcEndpoint`]s for a calling service.
#[derive(Debug, Clone)]
pub struct EndpointFactory {
    service_id: MetadataValue<Ascii>,
    breaker_config: CircuitBreakerConfig,
    budget: CallBudget,
    breakers: Arc<BreakerRegistry>,
}

impl EndpointFactory {
    /// `service_id` identifies the caller in the `service-id` header.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] if `service_id` is empty or not a
    /// valid header value.
    #[allow(clippy::result_large_err)]
    pub fn new(service_id: &str, config: &EndpointConfig) -> Result<Self> {
        if service_id.is_empty() {
            return Err(InfraError::Config("service id must not be empty".to_string()));
        }
        let service_id = service_id.parse::<MetadataValue<Ascii>>().map_err(|e| {
            InfraError::Config(format!("invalid service id {:?}: {}", service_id, e))
        })?;

        Ok(Self {
            service_id,
            breaker_config: CircuitBreakerConfig::from_endpoint(config),
            budget: CallBudget::from_endpoint(config),
            breakers: Arc::new(BreakerRegistry::new()),
        })
    }

    /// Share breakers with other factories.
    #[must_use]
    pub fn with_registry(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Endpoint calling `/<service_name>/<method>` over `conn`.
    ///
    /// Endpoints for the same `service_name` and `method` share one
    /// breaker.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] for an empty service or method name.
    #[allow(clippy::result_large_err)]
    pub fn make_endpoint<Req, Resp>(
        &self,
        conn: &ClientConn,
        service_name: &str,
        method: &str,
    ) -> Result<GrpcEndpoint<Req, Resp>> {
        if service_name.is_empty() || method.is_empty() {
            return Err(InfraError::Config(format!(
                "endpoint needs a service and a method, got {:?} and {:?}",
                service_name, method
            )));
        }
        if service_name.contains('/') || method.contains('/') {
            return Err(InfraError::Config(format!(
                "invalid endpoint {}/{}",
                service_name, method
            )));
        }

        let name = format!("{}.{}", service_name, method);
        let breaker = self.breakers.get_or_create(&name, &self.breaker_config);

        Ok(GrpcEndpoint {
            conn: conn.clone(),
            path: format!("/{}/{}", service_name, method),
            service_id: self.service_id.clone(),
            breaker,
            budget: self.budget,
            _marker: PhantomData,
        })
    }
}

/// A breaker-guarded call to one remote method.
pub struct GrpcEndpoint<Req, Resp> {
    conn: ClientConn,
    path: String,
    service_id: MetadataValue<Ascii>,
    breaker: Arc<CircuitBreaker>,
    budget: CallBudget,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for GrpcEndpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
            service_id: self.service_id.clone(),
            breaker: self.breaker.clone(),
            budget: self.budget,
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp> std::fmt::Debug for GrpcEndpoint<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcEndpoint")
            .field("path", &self.path)
            .field("breaker", &self.breaker.name())
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> GrpcEndpoint<Req, Resp>
where
    Req: prost::Message + Clone + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    /// Send `request` and return the reply message.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::CircuitOpen`] without contacting the peer while
    /// the breaker is open, [`InfraError::Timeout`] when the budget runs
    /// out, and [`InfraError::Api`] with the peer's status otherwise.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        self.call_with_request(Request::new(request))
            .await
            .map(Response::into_inner)
    }

    /// Like [`call`](Self::call), keeping caller metadata and returning the
    /// full response.
    pub async fn call_with_request(&self, request: Request<Req>) -> Result<Response<Resp>> {
        let (metadata, _, message) = request.into_parts();

        self.budget
            .run(|| {
                let mut request = Request::from_parts(
                    metadata.clone(),
                    tonic::Extensions::new(),
                    message.clone(),
                );
                stamp_service_id(request.metadata_mut(), &self.service_id);
                self.breaker.call(|| async move {
                    self.conn
                        .unary::<Req, Resp>(request, &self.path)
                        .await
                        .map_err(InfraError::from)
                })
            })
            .await
    }
}

impl<Req, Resp> GrpcEndpoint<Req, Resp> {
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// `/<service>/<method>`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn budget(&self) -> CallBudget {
        self.budget
    }
}

/// Set the `service-id` header, replacing any value the caller supplied.
fn stamp_service_id(metadata: &mut MetadataMap, service_id: &MetadataValue<Ascii>) {
    metadata.insert(SERVICE_ID_HEADER, service_id.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcClientBuilder;
    use crate::testkit::{EchoReply, EchoRequest};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_stamp_service_id_replaces_value() {
        let mut metadata = MetadataMap::new();
        metadata.insert(SERVICE_ID_HEADER, "spoofed".parse().unwrap());

        stamp_service_id(&mut metadata, &"gateway".parse().unwrap());

        assert_eq!(metadata.get(SERVICE_ID_HEADER).unwrap().to_str().unwrap(), "gateway");
        assert_eq!(metadata.get_all(SERVICE_ID_HEADER).iter().count(), 1);
    }

    #[test]
    fn test_factory_rejects_bad_service_id() {
        let config = EndpointConfig::default();
        assert!(matches!(
            EndpointFactory::new("", &config),
            Err(InfraError::Config(_))
        ));
        assert!(matches!(
            EndpointFactory::new("gate\nway", &config),
            Err(InfraError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_endpoints_share_breaker_per_method() {
        let conn = RpcClientBuilder::new().dial("127.0.0.1:1").unwrap();
        let factory = EndpointFactory::new("gateway", &EndpointConfig::default()).unwrap();

        let a = factory
            .make_endpoint::<EchoRequest, EchoReply>(&conn, "echo.EchoService", "Echo")
            .unwrap();
        let b = factory
            .make_endpoint::<EchoRequest, EchoReply>(&conn, "echo.EchoService", "Echo")
            .unwrap();
        let c = factory
            .make_endpoint::<EchoRequest, EchoReply>(&conn, "echo.EchoService", "Stream")
            .unwrap();

        assert!(Arc::ptr_eq(a.breaker(), b.breaker()));
        assert!(!Arc::ptr_eq(a.breaker(), c.breaker()));
        assert_eq!(a.breaker().name(), "echo.EchoService.Echo");
        assert_eq!(a.path(), "/echo.EchoService/Echo");
        assert_eq!(factory.breakers().len(), 2);
        assert_eq!(
            a.breaker().config().reset_timeout,
            Duration::from_secs(60)
        );
        conn.close();
    }

    #[tokio::test]
    async fn test_make_endpoint_rejects_empty_names() {
        let conn = RpcClientBuilder::new().dial("127.0.0.1:1").unwrap();
        let factory = EndpointFactory::new("gateway", &EndpointConfig::default()).unwrap();

        assert!(factory
            .make_endpoint::<EchoRequest, EchoReply>(&conn, "", "Echo")
            .is_err());
        assert!(factory
            .make_endpoint::<EchoRequest, EchoReply>(&conn, "echo.EchoService", "")
            .is_err());
        conn.close();
    }

    #[test]
    fn test_budget_defaults() {
        let budget = CallBudget::default();
        assert_eq!(budget.max_attempts(), 1);
        assert_eq!(budget.timeout(), Duration::from_secs(15));
        assert_eq!(CallBudget::new(0, Duration::from_secs(1)).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_budget_single_attempt_returns_error() {
        let calls = AtomicU32::new(0);
        let budget = CallBudget::new(1, Duration::from_secs(15));

        let result: Result<()> = budget
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InfraError::Api(tonic::Status::unavailable("down"))) }
            })
            .await;

        assert!(matches!(result, Err(InfraError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_retries_until_success() {
        let calls = AtomicU32::new(0);
        let budget = CallBudget::new(3, Duration::from_secs(15));

        let result = budget
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(InfraError::Unknown("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_times_out() {
        let budget = CallBudget::new(1, Duration::from_secs(15));

        let result: Result<()> = budget
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(InfraError::Timeout(d)) if d == Duration::from_secs(15)));
    }
}
