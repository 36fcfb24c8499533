// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instrumented RPC server.
//!
//! [`RpcServerBuilder`] turns a service name and an RPC logger into an
//! [`RpcServer`] with fixed transport limits, keepalive policy and the
//! interceptor chain from [`layers`]: trace propagation, request metrics,
//! call logging and panic recovery, outermost first.
//!
//! Metrics are registered on the given registry by
//! [`RpcServerBuilder::build`]; every service added afterwards seeds its
//! methods' series at zero.
//!
//! # Example
//!
//! ```no_run
//! use chat_infra::config::LogConfig;
//! use chat_infra::logging::LogFactory;
//! use chat_infra::server::RpcServerBuilder;
//! use chat_infra::testkit::EchoServer;
//! use prometheus::Registry;
//! use std::time::Duration;
//!
//! # async fn run() -> chat_infra::error::Result<()> {
//! let logger = LogFactory::new(&LogConfig::default()).new_grpc_log()?;
//! let registry = Registry::new();
//!
//! let mut server = RpcServerBuilder::new("room", logger).build(&registry)?;
//! let echo = EchoServer::default();
//! server.add_service(
//!     |limit| echo.clone().with_max_recv_msg_size(limit),
//!     &EchoServer::methods(),
//! );
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! let running = server.start(listener)?;
//! running.graceful_stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod layers;

pub use crate::runtime::metrics::{MethodInfo, MethodKind};

use crate::config::ServerConfig;
use crate::error::{InfraError, Result};
use crate::logging::Logger;
use crate::runtime::metrics::ServerMetrics;
use layers::{LoggingLayer, MetricsLayer, RecoveryLayer, TraceLayer};
use prometheus::Registry;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tower::{Service, ServiceBuilder};

/// Builds an [`RpcServer`].
#[derive(Debug, Clone)]
pub struct RpcServerBuilder {
    service_name: String,
    logger: Logger,
    config: ServerConfig,
}

impl RpcServerBuilder {
    /// `service_name` becomes the metrics namespace and `serviceID` label.
    pub fn new(service_name: impl Into<String>, logger: Logger) -> Self {
        Self {
            service_name: service_name.into(),
            logger,
            config: ServerConfig::default(),
        }
    }

    /// Replace the transport limits and keepalive policy.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the server metrics on `registry` and return the server.
    ///
    /// # Errors
    ///
    /// Fails with [`InfraError::Metrics`] if this service's metrics are
    /// already registered on `registry`.
    #[allow(clippy::result_large_err)]
    pub fn build(self, registry: &Registry) -> Result<RpcServer> {
        let metrics = ServerMetrics::register(
            registry,
            &self.service_name,
            &self.config.handling_buckets,
        )?;

        Ok(RpcServer {
            service_name: self.service_name,
            logger: self.logger,
            config: self.config,
            metrics,
            methods: Vec::new(),
            routes: RoutesBuilder::default(),
        })
    }
}

/// A configured server that is not serving yet.
pub struct RpcServer {
    service_name: String,
    logger: Logger,
    config: ServerConfig,
    metrics: ServerMetrics,
    methods: Vec<MethodInfo>,
    routes: RoutesBuilder,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl RpcServer {
    /// Register a service and the methods it serves.
    ///
    /// `make` receives the configured maximum receive message size, which
    /// the service applies to its request decoder, e.g.
    /// `|limit| RoomServiceServer::new(room).max_decoding_message_size(limit)`.
    pub fn add_service<S, F>(&mut self, make: F, methods: &[MethodInfo]) -> &mut Self
    where
        F: FnOnce(usize) -> S,
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let service = make(self.config.max_recv_msg_size);
        self.metrics.initialize_methods(methods);
        self.methods.extend_from_slice(methods);
        self.routes.add_service(service);
        self
    }

    #[must_use]
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind `addr` and serve until `signal` resolves, then drain in-flight
    /// calls.
    pub async fn serve_with_shutdown<F>(self, addr: SocketAddr, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on `listener` from a background task.
    ///
    /// Must be called from within a tokio runtime.
    #[allow(clippy::result_large_err)]
    pub fn start(self, listener: TcpListener) -> Result<RunningServer> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(self.serve_listener(listener, signal));

        Ok(RunningServer {
            local_addr,
            shutdown,
            task,
        })
    }

    async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let config = self.config;
        tracing::info!(
            service = %self.service_name,
            addr = ?listener.local_addr().ok(),
            methods = self.methods.len(),
            "serving rpc"
        );
        tracing::debug!(
            keepalive_min_time = ?config.keepalive_min_time,
            keepalive_permit_without_stream = config.keepalive_permit_without_stream,
            max_connection_idle = ?config.max_connection_idle,
            max_connection_age_grace = ?config.max_connection_age_grace,
            "transport settings not enforced by the http2 server"
        );

        let chain = ServiceBuilder::new()
            .layer(TraceLayer::new())
            .layer(MetricsLayer::new(self.metrics.clone()))
            .layer(LoggingLayer::new(self.logger.clone(), &self.methods))
            .layer(RecoveryLayer::new(self.metrics, self.logger))
            .into_inner();

        Server::builder()
            .http2_keepalive_interval(Some(config.keepalive_time))
            .http2_keepalive_timeout(Some(config.keepalive_timeout))
            .max_connection_age(config.max_connection_age)
            .layer(chain)
            .add_routes(self.routes.routes())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;

        tracing::info!(service = %self.service_name, "rpc server stopped");
        Ok(())
    }
}

/// Handle to a server started with [`RpcServer::start`].
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl RunningServer {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait up to `deadline` for in-flight
    /// calls to finish.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Timeout`] if calls are still running at the
    /// deadline (the server is then aborted), or the error the server
    /// stopped with.
    pub async fn graceful_stop(mut self, deadline: Duration) -> Result<()> {
        self.shutdown.cancel();
        match tokio::time::timeout(deadline, &mut self.task).await {
            Ok(joined) => joined.map_err(|e| InfraError::Unknown(e.to_string()))?,
            Err(_) => {
                self.task.abort();
                Err(InfraError::Timeout(deadline))
            }
        }
    }

    /// Abort the server without draining.
    pub fn stop(self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}
