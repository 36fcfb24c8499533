// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;
use thiserror::Error;

#[allow(clippy::result_large_err)]
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC failed: {0}")]
    Api(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl InfraError {
    /// Returns `true` for errors produced by an open or saturated breaker.
    #[must_use]
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(
            self,
            InfraError::CircuitOpen(_) | InfraError::TooManyRequests(_)
        )
    }

    /// The wire status this error is reported as.
    #[must_use]
    pub fn to_status(&self) -> tonic::Status {
        match self {
            InfraError::Api(status) => status.clone(),
            InfraError::Config(msg) => tonic::Status::invalid_argument(msg.clone()),
            InfraError::Transport(e) => tonic::Status::unavailable(e.to_string()),
            InfraError::CircuitOpen(msg) | InfraError::TooManyRequests(msg) => {
                tonic::Status::unavailable(msg.clone())
            }
            InfraError::Timeout(_) => tonic::Status::deadline_exceeded(self.to_string()),
            InfraError::Io(e) => tonic::Status::unavailable(e.to_string()),
            InfraError::Metrics(_) | InfraError::Unknown(_) => {
                tonic::Status::internal(self.to_string())
            }
        }
    }
}

impl From<InfraError> for tonic::Status {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Api(status) => status,
            other => other.to_status(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InfraError>;
