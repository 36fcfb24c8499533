// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP routing surface.
//!
//! [`Router`] drives any [`HttpServer`]: running it wires the domain routes
//! (once) and serves them until the server is stopped gracefully. [`AxumHttpServer`] is the
//! axum-backed implementation; every request it serves is written to the
//! HTTP logger.
//!
//! # Example
//!
//! ```no_run
//! use axum::routing::get;
//! use chat_infra::config::LogConfig;
//! use chat_infra::http::{AxumHttpServer, Router};
//! use chat_infra::logging::LogFactory;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> chat_infra::error::Result<()> {
//! let logger = LogFactory::new(&LogConfig::default()).new_http_log()?;
//! let server = AxumHttpServer::new("0.0.0.0:8080".parse().unwrap(), logger, || {
//!     axum::Router::new().route("/healthz", get(|| async { "ok" }))
//! });
//!
//! let router = Arc::new(Router::new(server));
//! let serving = tokio::spawn({
//!     let router = router.clone();
//!     async move { router.run().await }
//! });
//!
//! router.graceful_stop(Duration::from_secs(5)).await?;
//! # let _ = serving.await;
//! # Ok(())
//! # }
//! ```

use crate::error::{InfraError, Result};
use crate::logging::{LogLevel, Logger};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Contract of an HTTP server driven by [`Router`].
pub trait HttpServer: Send + Sync {
    /// Wire the domain handlers. Calling it again has no effect.
    fn register_routes(&self);

    /// Accept requests until the server is stopped or the listener fails.
    /// Routes must be registered first.
    fn run(&self) -> impl Future<Output = Result<()>> + Send;

    /// Stop accepting requests and wait up to `deadline` for in-flight ones.
    fn graceful_stop(&self, deadline: Duration) -> impl Future<Output = Result<()>> + Send;
}

/// Delegates the HTTP lifecycle to an embedded [`HttpServer`].
#[derive(Debug)]
pub struct Router<S> {
    server: S,
}

impl<S: HttpServer> Router<S> {
    pub fn new(server: S) -> Self {
        Self { server }
    }

    pub fn register_routes(&self) {
        self.server.register_routes();
    }

    /// Register the routes and serve them. Blocks until the server stops.
    pub async fn run(&self) -> Result<()> {
        self.server.register_routes();
        self.server.run().await
    }

    pub async fn graceful_stop(&self, deadline: Duration) -> Result<()> {
        self.server.graceful_stop(deadline).await
    }

    #[must_use]
    pub fn server(&self) -> &S {
        &self.server
    }
}

type RouteFactory = Box<dyn Fn() -> axum::Router + Send + Sync>;

/// [`HttpServer`] on top of axum.
pub struct AxumHttpServer {
    addr: SocketAddr,
    logger: Logger,
    routes: RouteFactory,
    router: OnceLock<axum::Router>,
    local_addr: OnceLock<SocketAddr>,
    running: AtomicBool,
    shutdown: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl std::fmt::Debug for AxumHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxumHttpServer")
            .field("addr", &self.addr)
            .field("registered", &self.router.get().is_some())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AxumHttpServer {
    /// Server listening on `addr`; `routes` builds the domain routes when
    /// they are registered.
    pub fn new<F>(addr: SocketAddr, logger: Logger, routes: F) -> Self
    where
        F: Fn() -> axum::Router + Send + Sync + 'static,
    {
        let (stopped, _) = watch::channel(false);
        Self {
            addr,
            logger,
            routes: Box::new(routes),
            router: OnceLock::new(),
            local_addr: OnceLock::new(),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stopped,
        }
    }

    /// Address bound by the running server.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Serve the registered routes on an already bound `listener`.
    ///
    /// # Errors
    ///
    /// Fails with [`InfraError::Config`] if the routes are not registered or
    /// the server is already running.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let router = self
            .router
            .get()
            .cloned()
            .ok_or_else(|| InfraError::Config("http routes are not registered".to_string()))?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(InfraError::Config("http server is already running".to_string()));
        }

        self.logger.info("http server listening", &[("addr", &addr)]);
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await;

        self.running.store(false, Ordering::Release);
        self.stopped.send_replace(true);
        match served {
            Ok(()) => {
                self.logger.info("http server stopped", &[("addr", &addr)]);
                Ok(())
            }
            Err(e) => {
                self.logger
                    .error("http server failed", &[("addr", &addr), ("error", &e)]);
                Err(e.into())
            }
        }
    }
}

impl HttpServer for AxumHttpServer {
    fn register_routes(&self) {
        self.router.get_or_init(|| {
            (self.routes)().layer(middleware::from_fn_with_state(
                self.logger.clone(),
                access_log,
            ))
        });
    }

    async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.run_with_listener(listener).await
    }

    async fn graceful_stop(&self, deadline: Duration) -> Result<()> {
        self.shutdown.cancel();
        if !self.is_running() {
            return Ok(());
        }
        let mut stopped = self.stopped.subscribe();
        let outcome = match tokio::time::timeout(deadline, stopped.wait_for(|done| *done)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(InfraError::Timeout(deadline)),
        };
        outcome
    }
}

async fn access_log(State(logger): State<Logger>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let level = match status {
        500..=u16::MAX => LogLevel::Error,
        400..=499 => LogLevel::Warn,
        _ => LogLevel::Info,
    };
    let elapsed_ms = format!("{:.3}", start.elapsed().as_secs_f64() * 1000.0);
    logger.log(
        level,
        "finished request",
        &[
            ("protocol", &"http"),
            ("http.method", &method),
            ("http.path", &path),
            ("http.status", &status),
            ("http.time_ms", &elapsed_ms),
        ],
    );
    response
}
