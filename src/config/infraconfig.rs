// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{InfraError, Result};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Handling-time histogram buckets, in seconds.
pub const DEFAULT_HANDLING_BUCKETS: [f64; 14] = [
    0.001, 0.01, 0.1, 0.3, 0.6, 1.0, 3.0, 6.0, 9.0, 20.0, 30.0, 60.0, 90.0, 120.0,
];

/// Top-level configuration shared by every component of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InfraConfig {
    /// Service name, used as metrics namespace and `serviceID` label.
    pub service_name: String,
    /// Identity sent in the `Service-Id` header of outbound calls.
    pub service_id: String,
    pub log: LogConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub endpoint: EndpointConfig,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            service_name: "chat".to_string(),
            service_id: "chat".to_string(),
            log: LogConfig::default(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl InfraConfig {
    /// Parse a configuration document.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| InfraError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(InfraError::Config("serviceName must not be empty".to_string()));
        }
        if self.client.retry.max_attempts == 0 {
            return Err(InfraError::Config(
                "client.retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.client.retry.jitter) {
            return Err(InfraError::Config(format!(
                "client.retry.jitter must be within [0, 1], got {}",
                self.client.retry.jitter
            )));
        }
        if self.endpoint.retry_max_attempts == 0 {
            return Err(InfraError::Config(
                "endpoint.retryMaxAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logger thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub http_level: LogLevel,
    pub grpc_level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            http_level: LogLevel::Info,
            grpc_level: LogLevel::Error,
        }
    }
}

/// Transport limits and keepalive policy of the RPC server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub max_recv_msg_size: usize,
    #[serde(with = "duration_ms")]
    pub keepalive_min_time: Duration,
    pub keepalive_permit_without_stream: bool,
    #[serde(with = "duration_ms")]
    pub max_connection_idle: Duration,
    #[serde(with = "duration_ms")]
    pub max_connection_age: Duration,
    #[serde(with = "duration_ms")]
    pub max_connection_age_grace: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_time: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_timeout: Duration,
    pub handling_buckets: Vec<f64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_recv_msg_size: 8 * 1024 * 1024,
            keepalive_min_time: Duration::from_secs(5),
            keepalive_permit_without_stream: true,
            max_connection_idle: Duration::from_secs(15),
            max_connection_age: Duration::from_secs(600),
            max_connection_age_grace: Duration::from_secs(5),
            keepalive_time: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(1),
            handling_buckets: DEFAULT_HANDLING_BUCKETS.to_vec(),
        }
    }
}

/// Per-call retry settings of the RPC client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
    /// Fraction of `backoff` the wait may deviate by.
    pub jitter: f64,
    #[serde(with = "duration_ms")]
    pub per_attempt_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            jitter: 0.1,
            per_attempt_timeout: Duration::from_secs(3),
        }
    }
}

/// Dial options of the RPC client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Port used when the target host carries none.
    pub default_port: u16,
    #[serde(with = "duration_ms")]
    pub keepalive_time: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_timeout: Duration,
    pub keepalive_permit_without_stream: bool,
    #[serde(with = "duration_ms")]
    pub resolve_interval: Duration,
    pub retry: RetrySettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_port: 443,
            keepalive_time: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(1),
            keepalive_permit_without_stream: true,
            resolve_interval: Duration::from_secs(30),
            retry: RetrySettings::default(),
        }
    }
}

/// Breaker and outer retry budget of callable endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Time an open breaker waits before letting a trial call through.
    #[serde(with = "duration_ms")]
    pub breaker_timeout: Duration,
    /// Consecutive failures that trip the breaker.
    pub breaker_failure_threshold: usize,
    /// Trial calls admitted while half-open.
    pub breaker_half_open_max_requests: usize,
    pub retry_max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            breaker_timeout: Duration::from_secs(60),
            breaker_failure_threshold: 6,
            breaker_half_open_max_requests: 1,
            retry_max_attempts: 1,
            retry_timeout: Duration::from_secs(15),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
serviceName: room
serviceId: room-service
log:
  httpLevel: debug
server:
  maxConnectionAge: 120000
client:
  defaultPort: 50051
  retry:
    backoff: 250
endpoint:
  breakerTimeout: 1000
"#;

    #[test]
    fn test_defaults() {
        let config = InfraConfig::default();
        assert_eq!(config.log.http_level, LogLevel::Info);
        assert_eq!(config.log.grpc_level, LogLevel::Error);
        assert_eq!(config.server.max_recv_msg_size, 8 * 1024 * 1024);
        assert_eq!(config.server.keepalive_time, Duration::from_secs(5));
        assert_eq!(config.server.keepalive_timeout, Duration::from_secs(1));
        assert_eq!(config.server.max_connection_age, Duration::from_secs(600));
        assert_eq!(config.server.handling_buckets.len(), 14);
        assert_eq!(config.client.keepalive_time, Duration::from_secs(10));
        assert_eq!(config.client.retry.max_attempts, 3);
        assert_eq!(config.client.retry.per_attempt_timeout, Duration::from_secs(3));
        assert_eq!(config.endpoint.breaker_timeout, Duration::from_secs(60));
        assert_eq!(config.endpoint.retry_max_attempts, 1);
        assert_eq!(config.endpoint.retry_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_parse_overrides() {
        let config = InfraConfig::from_yaml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.service_name, "room");
        assert_eq!(config.service_id, "room-service");
        assert_eq!(config.log.http_level, LogLevel::Debug);
        assert_eq!(config.log.grpc_level, LogLevel::Error);
        assert_eq!(config.server.max_connection_age, Duration::from_secs(120));
        assert_eq!(config.server.max_connection_idle, Duration::from_secs(15));
        assert_eq!(config.client.default_port, 50051);
        assert_eq!(config.client.retry.backoff, Duration::from_millis(250));
        assert_eq!(config.client.retry.max_attempts, 3);
        assert_eq!(config.endpoint.breaker_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = InfraConfig::from_yaml("serviceName: [unclosed");
        assert!(matches!(result, Err(InfraError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = InfraConfig::from_yaml("client:\n  retry:\n    maxAttempts: 0\n");
        match result {
            Err(InfraError::Config(msg)) => assert!(msg.contains("maxAttempts")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_out_of_range_jitter() {
        let result = InfraConfig::from_yaml("client:\n  retry:\n    jitter: 1.5\n");
        assert!(matches!(result, Err(InfraError::Config(_))));
    }

    #[test]
    fn test_yaml_roundtrip_keeps_millis() {
        let config = InfraConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("maxConnectionAge: 600000"));
        assert_eq!(InfraConfig::from_yaml(&yaml).unwrap(), config);
    }
}
