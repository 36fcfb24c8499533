// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed configuration for the transport infrastructure.
//!
//! Every struct carries the production defaults in its `Default` impl, so an
//! empty document yields a fully working configuration. Durations are written
//! as integer milliseconds.
//!
//! # Example
//!
//! ```
//! use chat_infra::config::InfraConfig;
//!
//! let config = InfraConfig::from_yaml(
//!     r#"
//! serviceName: room
//! serviceId: room-service
//! client:
//!   retry:
//!     maxAttempts: 2
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.client.retry.max_attempts, 2);
//! assert_eq!(config.server.max_recv_msg_size, 8 * 1024 * 1024);
//! ```

mod infraconfig;

pub use infraconfig::{
    ClientConfig, EndpointConfig, InfraConfig, LogConfig, RetrySettings, ServerConfig,
    DEFAULT_HANDLING_BUCKETS,
};
