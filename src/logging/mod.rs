// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured loggers for HTTP and RPC traffic.
//!
//! A [`LogFactory`] hands out two [`Logger`] handles over one textual sink:
//! the HTTP logger records at `Info` and above, the RPC logger only at
//! `Error` and above. Each handle owns a private `tracing` dispatcher, so the
//! thresholds are independent of whatever subscriber the process installed
//! through [`init_default_logger`].
//!
//! # Example
//!
//! ```
//! use chat_infra::config::LogConfig;
//! use chat_infra::logging::{LogFactory, LogLevel};
//!
//! let factory = LogFactory::new(&LogConfig::default());
//! let http = factory.new_http_log().unwrap();
//! let grpc = factory.new_grpc_log().unwrap();
//!
//! assert_eq!(http.level(), LogLevel::Info);
//! assert_eq!(grpc.level(), LogLevel::Error);
//! http.info("listening", &[("addr", &"0.0.0.0:8080")]);
//! ```

use crate::config::LogConfig;
use crate::error::{InfraError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn, Dispatch};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};
use tracing_subscriber::EnvFilter;

/// Severity of a log record, ordered from most to least verbose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level - most verbose.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level - only errors.
    Error,
    /// Disabled - no logging.
    Off,
}

impl LogLevel {
    /// The matching `tracing` filter.
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Off => write!(f, "OFF"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" => Ok(LogLevel::Off),
            other => Err(InfraError::Config(format!("unknown log level: {}", other))),
        }
    }
}

/// Traffic a logger is tagged with, rendered as the `proto` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http,
    Grpc,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Http => write!(f, "http"),
            Proto::Grpc => write!(f, "grpc"),
        }
    }
}

/// A key/value pair attached to a log record.
pub type Field<'a> = (&'a str, &'a dyn fmt::Display);

macro_rules! emit {
    ($level:expr, $proto:expr, $line:expr) => {
        match $level {
            LogLevel::Trace => trace!(proto = %$proto, "{}", $line),
            LogLevel::Debug => debug!(proto = %$proto, "{}", $line),
            LogLevel::Info => info!(proto = %$proto, "{}", $line),
            LogLevel::Warn => warn!(proto = %$proto, "{}", $line),
            LogLevel::Error => error!(proto = %$proto, "{}", $line),
            LogLevel::Off => {}
        }
    };
}

/// An immutable structured logger tagged with a protocol and a threshold.
#[derive(Clone, Debug)]
pub struct Logger {
    proto: Proto,
    level: LogLevel,
    dispatch: Dispatch,
}

impl Logger {
    fn new(proto: Proto, level: LogLevel, make_writer: BoxMakeWriter) -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(make_writer)
            .with_max_level(level.as_level_filter())
            .with_ansi(false)
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .finish();
        Self {
            proto,
            level,
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Protocol tag of this handle.
    #[must_use]
    pub fn proto(&self) -> Proto {
        self.proto
    }

    /// Severity threshold of this handle.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Returns `true` if a record at `level` would be written.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level >= self.level
    }

    pub fn log(&self, level: LogLevel, msg: &str, fields: &[Field<'_>]) {
        if !self.enabled(level) {
            return;
        }
        let line = render(msg, fields);
        tracing::dispatcher::with_default(&self.dispatch, || emit!(level, self.proto, line));
    }

    pub fn debug(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(LogLevel::Debug, msg, fields);
    }

    pub fn info(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(LogLevel::Info, msg, fields);
    }

    pub fn warn(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(LogLevel::Warn, msg, fields);
    }

    pub fn error(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(LogLevel::Error, msg, fields);
    }
}

/// Builds the HTTP and RPC loggers over a shared sink.
#[derive(Clone)]
pub struct LogFactory {
    config: LogConfig,
    make_writer: Arc<dyn Fn() -> BoxMakeWriter + Send + Sync>,
}

impl fmt::Debug for LogFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LogFactory {
    /// Create a factory writing to standard output.
    #[must_use]
    pub fn new(config: &LogConfig) -> Self {
        Self {
            config: config.clone(),
            make_writer: Arc::new(|| BoxMakeWriter::new(std::io::stdout)),
        }
    }

    /// Redirect every logger built afterwards to `make_writer`.
    #[must_use]
    pub fn with_writer<M>(mut self, make_writer: M) -> Self
    where
        M: for<'a> MakeWriter<'a> + Clone + Send + Sync + 'static,
    {
        self.make_writer = Arc::new(move || BoxMakeWriter::new(make_writer.clone()));
        self
    }

    /// Logger for HTTP traffic.
    ///
    /// The axum server has no global framework mode or default writer to
    /// redirect, so this has no side effects.
    #[allow(clippy::result_large_err)]
    pub fn new_http_log(&self) -> Result<Logger> {
        Ok(Logger::new(
            Proto::Http,
            self.config.http_level,
            (self.make_writer)(),
        ))
    }

    /// Logger for RPC traffic.
    #[allow(clippy::result_large_err)]
    pub fn new_grpc_log(&self) -> Result<Logger> {
        Ok(Logger::new(
            Proto::Grpc,
            self.config.grpc_level,
            (self.make_writer)(),
        ))
    }
}

/// Install the process-wide subscriber used by ad-hoc `tracing` calls.
///
/// Text records on standard output, `info` unless `RUST_LOG` says otherwise,
/// without source locations. Returns `false` if a global subscriber was
/// already installed.
pub fn init_default_logger() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok()
}

fn render(msg: &str, fields: &[Field<'_>]) -> String {
    let mut line = if msg.contains('\n') {
        format!("{:?}", msg)
    } else {
        msg.to_string()
    };
    for (key, value) in fields {
        let value = value.to_string();
        line.push(' ');
        line.push_str(key);
        line.push('=');
        if needs_quoting(&value) {
            line.push_str(&format!("{:?}", value));
        } else {
            line.push_str(&value);
        }
    }
    line
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '=' || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::LogBuffer;

    fn factory(buffer: &LogBuffer) -> LogFactory {
        LogFactory::new(&LogConfig::default()).with_writer(buffer.clone())
    }

    #[test]
    fn test_log_level_order() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Error < LogLevel::Off);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(InfraError::Config(_))
        ));
    }

    #[test]
    fn test_handles_carry_proto_and_level() {
        let buffer = LogBuffer::new();
        let factory = factory(&buffer);

        let http = factory.new_http_log().unwrap();
        assert_eq!(http.proto(), Proto::Http);
        assert_eq!(http.level(), LogLevel::Info);

        let grpc = factory.new_grpc_log().unwrap();
        assert_eq!(grpc.proto(), Proto::Grpc);
        assert_eq!(grpc.level(), LogLevel::Error);
    }

    #[test]
    fn test_http_logger_writes_info() {
        let buffer = LogBuffer::new();
        let http = factory(&buffer).new_http_log().unwrap();

        http.info("request served", &[("status", &200), ("path", &"/rooms")]);
        http.debug("hidden", &[]);

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("request served status=200 path=/rooms"));
        assert!(lines[0].contains("proto=http"));
    }

    #[test]
    fn test_grpc_logger_drops_below_error() {
        let buffer = LogBuffer::new();
        let grpc = factory(&buffer).new_grpc_log().unwrap();

        grpc.info("started call", &[]);
        grpc.warn("finished call", &[]);
        assert!(buffer.lines().is_empty());

        grpc.error("finished call", &[("grpc.code", &"Internal")]);
        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("ERROR"));
        assert!(lines[0].contains("proto=grpc"));
    }

    #[test]
    fn test_configured_levels() {
        let buffer = LogBuffer::new();
        let config = LogConfig {
            http_level: LogLevel::Off,
            grpc_level: LogLevel::Debug,
        };
        let factory = LogFactory::new(&config).with_writer(buffer.clone());

        factory.new_http_log().unwrap().error("dropped", &[]);
        factory.new_grpc_log().unwrap().debug("kept", &[]);

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("kept"));
    }

    #[test]
    fn test_render_quotes_values() {
        let line = render("msg", &[("a", &"plain"), ("b", &"two words"), ("c", &"")]);
        assert_eq!(line, r#"msg a=plain b="two words" c="""#);
    }

    #[test]
    fn test_render_keeps_multiline_message_on_one_line() {
        let line = render("stack:\n  0: main", &[]);
        assert!(!line.contains('\n'));
        assert!(line.contains("0: main"));
    }
}
