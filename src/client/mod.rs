// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilient RPC client.
//!
//! [`RpcClientBuilder::dial`] resolves `dns:///<host>` in the background and
//! balances calls round-robin over the resolved addresses. Connections are
//! plaintext, kept alive with 10s pings and opened lazily, so dialing never
//! blocks and an unreachable peer only shows up on the first call.
//!
//! Every call made through a [`ClientConn`] is retried on `Unavailable` and
//! `Aborted`, at most three attempts in total, roughly one second apart, and
//! each attempt is capped at three seconds.
//!
//! # Example
//!
//! ```no_run
//! use chat_infra::client::RpcClientBuilder;
//! use chat_infra::testkit::{EchoReply, EchoRequest};
//! use tonic::Request;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = RpcClientBuilder::new().dial("room-service:50051")?;
//!
//! let reply = conn
//!     .unary::<EchoRequest, EchoReply>(
//!         Request::new(EchoRequest::new("hello")),
//!         "/echo.EchoService/Echo",
//!     )
//!     .await?;
//! println!("{}", reply.into_inner().message);
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod pool;
pub mod resolver;

pub use endpoint::{CallBudget, EndpointFactory, GrpcEndpoint, SERVICE_ID_HEADER};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::runtime::tracing::{inject_context, RpcSpan};
use crate::runtime::RetryConfig;
use crate::server::layers::CallInfo;
use http::uri::PathAndQuery;
use pool::{BalancedChannel, ChannelSettings};
use resolver::Target;
use std::error::Error as StdError;
use tonic::codec::Streaming;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tonic_prost::ProstCodec;
use tracing::Instrument;

/// Dials [`ClientConn`]s.
#[derive(Debug, Clone, Default)]
pub struct RpcClientBuilder {
    config: ClientConfig,
}

impl RpcClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the keepalive, resolution and retry settings.
    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect to the logical service `host` (`host[:port]`, or a full
    /// `dns:///` target).
    ///
    /// No connection is opened here. Must be called from within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`](crate::error::InfraError::Config) if
    /// `host` is not a valid target.
    #[allow(clippy::result_large_err)]
    pub fn dial(&self, host: &str) -> Result<ClientConn> {
        let target = if host.contains("://") {
            Target::parse(host, self.config.default_port)?
        } else {
            Target::parse(
                &format!("{}:///{}", resolver::DNS_SCHEME, host),
                self.config.default_port,
            )?
        };

        let handle = resolver::spawn(target.clone(), self.config.resolve_interval);
        let pool = BalancedChannel::new(handle, ChannelSettings::from(&self.config));
        tracing::debug!(dial_target = %target, "dialed client connection");

        Ok(ClientConn {
            target,
            pool,
            retry: RetryConfig::from_settings(&self.config.retry),
        })
    }
}

/// A shared, load-balanced connection to one logical service.
///
/// Cloning is cheap; clones share the resolver and channels.
#[derive(Debug, Clone)]
pub struct ClientConn {
    target: Target,
    pool: BalancedChannel,
    retry: RetryConfig,
}

impl ClientConn {
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Replace the retry behaviour of this handle.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Issue a unary call to `path` (`/package.Service/Method`).
    ///
    /// Transient failures are retried; the status of the last attempt is
    /// returned once attempts run out.
    pub async fn unary<Req, Resp>(
        &self,
        request: Request<Req>,
        path: &str,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let path = parse_path(path)?;
        let call = CallInfo::from_path(path.path());
        let span = RpcSpan::client(&call.service, &call.method, &self.target.to_string());
        let (metadata, _, message) = request.into_parts();
        let metadata = metadata.into_headers();
        let per_attempt = self.retry.per_attempt_timeout;

        let result = self
            .retry
            .execute(|| {
                let mut request = self.attempt_request(&metadata, message.clone());
                if let Some(limit) = per_attempt {
                    request.set_timeout(limit);
                }
                let path = path.clone();
                async move {
                    let mut grpc = self.ready_client().await?;
                    grpc.unary(request, path, ProstCodec::<Req, Resp>::default())
                        .await
                        .map_err(normalize_status)
                }
            })
            .instrument(span.span().clone())
            .await;

        span.record_grpc_status(result.as_ref().map_or_else(Status::code, |_| tonic::Code::Ok));
        result
    }

    /// Open a server-streaming call to `path`.
    ///
    /// Only establishing the stream is retried; errors on an open stream
    /// surface from the returned [`Streaming`].
    pub async fn server_streaming<Req, Resp>(
        &self,
        request: Request<Req>,
        path: &str,
    ) -> std::result::Result<Response<Streaming<Resp>>, Status>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let path = parse_path(path)?;
        let call = CallInfo::from_path(path.path());
        let span = RpcSpan::client(&call.service, &call.method, &self.target.to_string());
        let (metadata, _, message) = request.into_parts();
        let metadata = metadata.into_headers();

        let result = self
            .retry
            .execute(|| {
                let request = self.attempt_request(&metadata, message.clone());
                let path = path.clone();
                async move {
                    let mut grpc = self.ready_client().await?;
                    grpc.server_streaming(request, path, ProstCodec::<Req, Resp>::default())
                        .await
                        .map_err(normalize_status)
                }
            })
            .instrument(span.span().clone())
            .await;

        if let Err(status) = &result {
            span.record_grpc_status(status.code());
        }
        result
    }

    /// Stop resolving. Calls issued afterwards fail with `Unavailable`.
    pub fn close(&self) {
        tracing::debug!(dial_target = %self.target, "closing client connection");
        self.pool.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Addresses the connection currently balances over.
    #[must_use]
    pub fn addresses(&self) -> Vec<std::net::SocketAddr> {
        self.pool.addresses()
    }

    /// A fresh request for one attempt, carrying the caller's metadata and
    /// the current trace context.
    fn attempt_request<M>(&self, metadata: &http::HeaderMap, message: M) -> Request<M> {
        let mut headers = metadata.clone();
        inject_context(&opentelemetry::Context::current(), &mut headers);
        Request::from_parts(
            MetadataMap::from_headers(headers),
            tonic::Extensions::new(),
            message,
        )
    }

    async fn ready_client(
        &self,
    ) -> std::result::Result<tonic::client::Grpc<tonic::transport::Channel>, Status> {
        let channel = self.pool.pick().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
        Ok(grpc)
    }
}

fn parse_path(path: &str) -> std::result::Result<PathAndQuery, Status> {
    if !path.starts_with('/') {
        return Err(Status::internal(format!("invalid method path {:?}", path)));
    }
    PathAndQuery::try_from(path)
        .map_err(|e| Status::internal(format!("invalid method path {:?}: {}", path, e)))
}

/// Connection failures that surface as `Unknown` are reported as
/// `Unavailable` so the retry policy sees them as transient.
fn normalize_status(status: Status) -> Status {
    if status.code() != tonic::Code::Unknown {
        return status;
    }
    let mut source = status.source();
    while let Some(err) = source {
        if err.is::<tonic::transport::Error>() || err.is::<std::io::Error>() {
            return Status::unavailable(status.message().to_string());
        }
        source = err.source();
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dial_prefixes_dns_scheme() {
        let conn = RpcClientBuilder::new().dial("chat-room:50051").unwrap();
        assert_eq!(conn.target().to_string(), "dns:///chat-room:50051");
        conn.close();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_dial_uses_default_port() {
        let conn = RpcClientBuilder::new().dial("chat-room").unwrap();
        assert_eq!(conn.target().port(), 443);
        conn.close();
    }

    #[tokio::test]
    async fn test_dial_rejects_other_schemes() {
        assert!(RpcClientBuilder::new().dial("unix:///tmp/sock").is_err());
    }

    #[tokio::test]
    async fn test_retry_defaults() {
        let conn = RpcClientBuilder::new().dial("127.0.0.1:1").unwrap();
        let retry = conn.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.per_attempt_timeout, Some(Duration::from_secs(3)));
        conn.close();
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("/echo.EchoService/Echo").unwrap().path(),
            "/echo.EchoService/Echo"
        );
        assert_eq!(
            parse_path("echo.EchoService/Echo").unwrap_err().code(),
            tonic::Code::Internal
        );
    }

    #[test]
    fn test_normalize_keeps_known_codes() {
        let status = normalize_status(Status::permission_denied("nope"));
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status = normalize_status(Status::unknown("handler said so"));
        assert_eq!(status.code(), tonic::Code::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_conn_fails_fast() {
        let conn = RpcClientBuilder::new().dial("127.0.0.1:1").unwrap();
        conn.close();

        let err = conn
            .unary::<crate::testkit::EchoRequest, crate::testkit::EchoReply>(
                Request::new(crate::testkit::EchoRequest::new("hi")),
                "/echo.EchoService/Echo",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }
}
