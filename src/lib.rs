// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport infrastructure for the chat backend.
//!
//! - [`logging`]: the HTTP and RPC loggers ([`LogFactory`]).
//! - [`server`]: an RPC server with trace propagation, request metrics, call
//!   logging and panic recovery ([`RpcServerBuilder`]).
//! - [`client`]: load-balanced RPC connections with transient-code retry
//!   ([`RpcClientBuilder`]) and breaker-guarded endpoints
//!   ([`EndpointFactory`]).
//! - [`http`]: the HTTP router lifecycle ([`http::Router`]).
//!
//! Configuration lives in [`config`]; resilience and observability
//! primitives shared by the above live in [`runtime`].

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod runtime;
pub mod server;
pub mod testkit;

pub use client::{ClientConn, EndpointFactory, GrpcEndpoint, RpcClientBuilder};
pub use config::InfraConfig;
pub use error::{InfraError, Result};
pub use logging::{LogFactory, LogLevel, Logger};
pub use server::{RpcServer, RpcServerBuilder, RunningServer};
