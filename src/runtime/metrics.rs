// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus metrics for the RPC server.
//!
//! Every series lives under the service namespace and carries the constant
//! label `serviceID=<service name>`:
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `<ns>_grpc_server_started_total` | `grpc_type`, `grpc_service`, `grpc_method` |
//! | `<ns>_grpc_server_handled_total` | the above plus `grpc_code` |
//! | `<ns>_grpc_server_handling_seconds` | `grpc_type`, `grpc_service`, `grpc_method` |
//! | `<ns>_grpc_server_msg_received_total` | `grpc_type`, `grpc_service`, `grpc_method` |
//! | `<ns>_grpc_server_msg_sent_total` | `grpc_type`, `grpc_service`, `grpc_method` |
//! | `<ns>_grpc_req_panics_recovered_total` | none |
//!
//! The registry is an explicit collaborator: registering the same service
//! twice on one registry fails with [`InfraError::Metrics`].
//!
//! # Exemplars
//!
//! The `prometheus` crate stores no exemplars, so the latest sampled
//! observation of every handled series and every method's histogram is kept
//! next to the registry. [`ServerMetrics::gather_openmetrics`] renders the
//! registry in the OpenMetrics text format with those exemplars attached
//! (`... # {traceID="<id>"} <value> <timestamp>`), the handled counter on
//! its code's sample and the histogram on the bucket the value fell into.
//!
//! # Example
//!
//! ```rust
//! use chat_infra::runtime::metrics::{MethodInfo, ServerMetrics};
//! use chat_infra::config::DEFAULT_HANDLING_BUCKETS;
//! use prometheus::Registry;
//! use std::time::Duration;
//!
//! let registry = Registry::new();
//! let metrics = ServerMetrics::register(&registry, "room", &DEFAULT_HANDLING_BUCKETS).unwrap();
//! metrics.initialize_methods(&[MethodInfo::unary("room.RoomService", "Join")]);
//!
//! metrics.record_started("room.RoomService", "Join");
//! metrics.record_handled("room.RoomService", "Join", tonic::Code::Ok, Duration::from_millis(3), None);
//!
//! let text = metrics.gather_text().unwrap();
//! assert!(text.contains("room_grpc_server_handled_total"));
//! ```

use crate::error::{InfraError, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Constant label carried by every series.
pub const SERVICE_ID_LABEL: &str = "serviceID";

/// Label of the trace id exemplar.
pub const TRACE_ID_LABEL: &str = "traceID";

/// Every status code, in wire order.
pub const ALL_CODES: [tonic::Code; 17] = [
    tonic::Code::Ok,
    tonic::Code::Cancelled,
    tonic::Code::Unknown,
    tonic::Code::InvalidArgument,
    tonic::Code::DeadlineExceeded,
    tonic::Code::NotFound,
    tonic::Code::AlreadyExists,
    tonic::Code::PermissionDenied,
    tonic::Code::ResourceExhausted,
    tonic::Code::FailedPrecondition,
    tonic::Code::Aborted,
    tonic::Code::OutOfRange,
    tonic::Code::Unimplemented,
    tonic::Code::Internal,
    tonic::Code::Unavailable,
    tonic::Code::DataLoss,
    tonic::Code::Unauthenticated,
];

/// Canonical name of a status code, as used in labels and log fields.
#[must_use]
pub fn code_name(code: tonic::Code) -> &'static str {
    match code {
        tonic::Code::Ok => "OK",
        tonic::Code::Cancelled => "Canceled",
        tonic::Code::Unknown => "Unknown",
        tonic::Code::InvalidArgument => "InvalidArgument",
        tonic::Code::DeadlineExceeded => "DeadlineExceeded",
        tonic::Code::NotFound => "NotFound",
        tonic::Code::AlreadyExists => "AlreadyExists",
        tonic::Code::PermissionDenied => "PermissionDenied",
        tonic::Code::ResourceExhausted => "ResourceExhausted",
        tonic::Code::FailedPrecondition => "FailedPrecondition",
        tonic::Code::Aborted => "Aborted",
        tonic::Code::OutOfRange => "OutOfRange",
        tonic::Code::Unimplemented => "Unimplemented",
        tonic::Code::Internal => "Internal",
        tonic::Code::Unavailable => "Unavailable",
        tonic::Code::DataLoss => "DataLoss",
        tonic::Code::Unauthenticated => "Unauthenticated",
    }
}

/// Replace every character that is not allowed in a metric name with `_`.
#[must_use]
pub fn sanitize_namespace(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Streaming shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MethodKind {
    #[default]
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl MethodKind {
    /// Value of the `grpc_type` label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ClientStream => "client_stream",
            MethodKind::ServerStream => "server_stream",
            MethodKind::BidiStream => "bidi_stream",
        }
    }

    #[must_use]
    pub fn is_streaming(self) -> bool {
        self != MethodKind::Unary
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method served by the RPC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Fully qualified service, e.g. `echo.EchoService`.
    pub service: String,
    pub method: String,
    pub kind: MethodKind,
}

impl MethodInfo {
    pub fn new(service: impl Into<String>, method: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
        }
    }

    pub fn unary(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(service, method, MethodKind::Unary)
    }

    pub fn server_stream(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(service, method, MethodKind::ServerStream)
    }

    /// Request path of the method, `/<service>/<method>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Latest sampled observation of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub trace_id: String,
    /// Handling time in seconds, or 1 for a counter increment.
    pub value: f64,
    pub timestamp: SystemTime,
}

impl Exemplar {
    fn new(trace_id: &str, value: f64) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            value,
            timestamp: SystemTime::now(),
        }
    }

    /// OpenMetrics exemplar suffix of a sample line.
    fn render(&self) -> String {
        let timestamp = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        format!(
            " # {{{}=\"{}\"}} {} {:.3}",
            TRACE_ID_LABEL, self.trace_id, self.value, timestamp
        )
    }
}

type MethodKey = (String, String);
type CodeKey = (String, String, &'static str);

#[derive(Default)]
struct Exemplars {
    /// Latest handling-time observation per method.
    handling: HashMap<MethodKey, Exemplar>,
    /// Latest increment per handled series.
    handled: HashMap<CodeKey, Exemplar>,
}

struct Inner {
    namespace: String,
    service_name: String,
    registry: Registry,
    started: IntCounterVec,
    handled: IntCounterVec,
    handling: HistogramVec,
    msg_received: IntCounterVec,
    msg_sent: IntCounterVec,
    panics: IntCounter,
    kinds: RwLock<HashMap<MethodKey, MethodKind>>,
    exemplars: Mutex<Exemplars>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMetrics")
            .field("namespace", &self.namespace)
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

/// Request metrics of one RPC server.
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl ServerMetrics {
    /// Create and register the server metrics of `service_name`.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty or the metrics are already registered.
    #[allow(clippy::result_large_err)]
    pub fn register(registry: &Registry, service_name: &str, buckets: &[f64]) -> Result<Self> {
        let namespace = sanitize_namespace(service_name);
        if namespace.is_empty() {
            return Err(InfraError::Config(
                "service name is required as metrics namespace".to_string(),
            ));
        }

        let counter_opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(namespace.clone())
                .const_label(SERVICE_ID_LABEL, service_name)
        };

        let started = IntCounterVec::new(
            counter_opts(
                "grpc_server_started_total",
                "Total number of RPCs started on the server.",
            ),
            &["grpc_type", "grpc_service", "grpc_method"],
        )?;
        let handled = IntCounterVec::new(
            counter_opts(
                "grpc_server_handled_total",
                "Total number of RPCs completed on the server, regardless of success or failure.",
            ),
            &["grpc_type", "grpc_service", "grpc_method", "grpc_code"],
        )?;
        let handling = HistogramVec::new(
            HistogramOpts::new(
                "grpc_server_handling_seconds",
                "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server.",
            )
            .namespace(namespace.clone())
            .const_label(SERVICE_ID_LABEL, service_name)
            .buckets(buckets.to_vec()),
            &["grpc_type", "grpc_service", "grpc_method"],
        )?;
        let msg_received = IntCounterVec::new(
            counter_opts(
                "grpc_server_msg_received_total",
                "Total number of RPC stream messages received on the server.",
            ),
            &["grpc_type", "grpc_service", "grpc_method"],
        )?;
        let msg_sent = IntCounterVec::new(
            counter_opts(
                "grpc_server_msg_sent_total",
                "Total number of gRPC stream messages sent by the server.",
            ),
            &["grpc_type", "grpc_service", "grpc_method"],
        )?;
        let panics = IntCounter::with_opts(counter_opts(
            "grpc_req_panics_recovered_total",
            "Total number of gRPC requests recovered from internal panic.",
        ))?;

        registry.register(Box::new(started.clone()))?;
        registry.register(Box::new(handled.clone()))?;
        registry.register(Box::new(handling.clone()))?;
        registry.register(Box::new(msg_received.clone()))?;
        registry.register(Box::new(msg_sent.clone()))?;
        registry.register(Box::new(panics.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                namespace,
                service_name: service_name.to_string(),
                registry: registry.clone(),
                started,
                handled,
                handling,
                msg_received,
                msg_sent,
                panics,
                kinds: RwLock::new(HashMap::new()),
                exemplars: Mutex::new(Exemplars::default()),
            }),
        })
    }

    /// Remember the kind of each method and create its series at zero, so
    /// never-called methods still show up in a scrape.
    pub fn initialize_methods(&self, methods: &[MethodInfo]) {
        let mut kinds = self
            .inner
            .kinds
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for info in methods {
            kinds.insert((info.service.clone(), info.method.clone()), info.kind);

            let labels = [info.kind.as_str(), &info.service, &info.method];
            self.inner.started.with_label_values(&labels);
            self.inner.handling.with_label_values(&labels);
            self.inner.msg_received.with_label_values(&labels);
            self.inner.msg_sent.with_label_values(&labels);
            for code in ALL_CODES {
                self.inner.handled.with_label_values(&[
                    info.kind.as_str(),
                    &info.service,
                    &info.method,
                    code_name(code),
                ]);
            }
        }
    }

    /// Kind of a registered method; unknown methods count as unary.
    #[must_use]
    pub fn method_kind(&self, service: &str, method: &str) -> MethodKind {
        self.inner
            .kinds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service.to_string(), method.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn record_started(&self, service: &str, method: &str) {
        let kind = self.method_kind(service, method);
        self.inner
            .started
            .with_label_values(&[kind.as_str(), service, method])
            .inc();
    }

    /// Count a finished call and observe its handling time. A sampled trace
    /// id becomes the method's exemplar.
    pub fn record_handled(
        &self,
        service: &str,
        method: &str,
        code: tonic::Code,
        elapsed: Duration,
        trace_id: Option<&str>,
    ) {
        let kind = self.method_kind(service, method).as_str();
        let seconds = elapsed.as_secs_f64();

        self.inner
            .handled
            .with_label_values(&[kind, service, method, code_name(code)])
            .inc();
        self.inner
            .handling
            .with_label_values(&[kind, service, method])
            .observe(seconds);

        if let Some(trace_id) = trace_id {
            let mut exemplars = self
                .inner
                .exemplars
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            exemplars.handling.insert(
                (service.to_string(), method.to_string()),
                Exemplar::new(trace_id, seconds),
            );
            exemplars.handled.insert(
                (service.to_string(), method.to_string(), code_name(code)),
                Exemplar::new(trace_id, 1.0),
            );
        }
    }

    /// Count messages read from a call's request stream.
    pub fn record_msg_received(&self, service: &str, method: &str, messages: u64) {
        let kind = self.method_kind(service, method);
        self.inner
            .msg_received
            .with_label_values(&[kind.as_str(), service, method])
            .inc_by(messages);
    }

    /// Count messages written to a call's response stream.
    pub fn record_msg_sent(&self, service: &str, method: &str, messages: u64) {
        let kind = self.method_kind(service, method);
        self.inner
            .msg_sent
            .with_label_values(&[kind.as_str(), service, method])
            .inc_by(messages);
    }

    pub fn record_panic(&self) {
        self.inner.panics.inc();
    }

    #[must_use]
    pub fn panics_recovered(&self) -> u64 {
        self.inner.panics.get()
    }

    #[must_use]
    pub fn started_count(&self, service: &str, method: &str) -> u64 {
        let kind = self.method_kind(service, method);
        self.inner
            .started
            .with_label_values(&[kind.as_str(), service, method])
            .get()
    }

    #[must_use]
    pub fn handled_count(&self, service: &str, method: &str, code: tonic::Code) -> u64 {
        let kind = self.method_kind(service, method);
        self.inner
            .handled
            .with_label_values(&[kind.as_str(), service, method, code_name(code)])
            .get()
    }

    /// Number of handling-time observations of a method.
    #[must_use]
    pub fn handling_count(&self, service: &str, method: &str) -> u64 {
        let kind = self.method_kind(service, method);
        self.inner
            .handling
            .with_label_values(&[kind.as_str(), service, method])
            .get_sample_count()
    }

    #[must_use]
    pub fn msg_received_count(&self, service: &str, method: &str) -> u64 {
        let kind = self.method_kind(service, method);
        self.inner
            .msg_received
            .with_label_values(&[kind.as_str(), service, method])
            .get()
    }

    #[must_use]
    pub fn msg_sent_count(&self, service: &str, method: &str) -> u64 {
        let kind = self.method_kind(service, method);
        self.inner
            .msg_sent
            .with_label_values(&[kind.as_str(), service, method])
            .get()
    }

    /// Latest sampled handling-time observation of a method.
    #[must_use]
    pub fn exemplar(&self, service: &str, method: &str) -> Option<Exemplar> {
        self.inner
            .exemplars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handling
            .get(&(service.to_string(), method.to_string()))
            .cloned()
    }

    /// Render the whole registry in the Prometheus text format.
    #[allow(clippy::result_large_err)]
    pub fn gather_text(&self) -> Result<String> {
        let families = self.inner.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| InfraError::Unknown(e.to_string()))
    }

    /// Render the whole registry in the OpenMetrics text format, with the
    /// latest `traceID` exemplars of this server's series.
    #[allow(clippy::result_large_err)]
    pub fn gather_openmetrics(&self) -> Result<String> {
        let text = self.gather_text()?;
        let handled_name = format!("{}_grpc_server_handled_total", self.inner.namespace);
        let bucket_name = format!("{}_grpc_server_handling_seconds_bucket", self.inner.namespace);
        let exemplars = self
            .inner
            .exemplars
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut out = String::with_capacity(text.len() + 64);
        let mut placed: HashSet<MethodKey> = HashSet::new();
        for line in text.lines() {
            if let Some(meta) = line.strip_prefix("# ") {
                out.push_str("# ");
                out.push_str(&openmetrics_meta(meta));
                out.push('\n');
                continue;
            }
            out.push_str(line);

            let Some((name, labels)) = split_sample(line) else {
                out.push('\n');
                continue;
            };
            let method_key = (
                label(&labels, "grpc_service").to_string(),
                label(&labels, "grpc_method").to_string(),
            );
            if name == handled_name {
                let code = code_from_name(label(&labels, "grpc_code"));
                let key = (method_key.0, method_key.1, code);
                if let Some(exemplar) = exemplars.handled.get(&key) {
                    out.push_str(&exemplar.render());
                }
            } else if name == bucket_name && !placed.contains(&method_key) {
                if let Some(exemplar) = exemplars.handling.get(&method_key) {
                    let le: f64 = label(&labels, "le").parse().unwrap_or(f64::INFINITY);
                    if exemplar.value <= le {
                        out.push_str(&exemplar.render());
                        placed.insert(method_key);
                    }
                }
            }
            out.push('\n');
        }
        out.push_str("# EOF\n");
        Ok(out)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }
}

/// `HELP`/`TYPE` comment in OpenMetrics form: counter families drop the
/// `_total` suffix their samples keep.
fn openmetrics_meta(meta: &str) -> String {
    let mut parts = meta.splitn(3, ' ');
    let (Some(kind), Some(name)) = (parts.next(), parts.next()) else {
        return meta.to_string();
    };
    let rest = parts.next().unwrap_or_default();
    let family = name.strip_suffix("_total").unwrap_or(name);
    let mut line = String::new();
    let _ = write!(line, "{} {}", kind, family);
    if !rest.is_empty() {
        let _ = write!(line, " {}", rest);
    }
    line
}

/// Metric name and labels of a text-format sample line.
fn split_sample(line: &str) -> Option<(&str, HashMap<String, String>)> {
    let open = line.find('{')?;
    let close = line.rfind('}')?;
    if close < open {
        return None;
    }
    Some((&line[..open], parse_labels(&line[open + 1..close])))
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut chars = raw.chars().peekable();
    loop {
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() || chars.next() != Some('"') {
            break;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(escaped) => value.push(escaped),
                    None => break,
                },
                '"' => break,
                _ => value.push(c),
            }
        }
        labels.insert(key, value);
        if chars.peek() == Some(&',') {
            chars.next();
        }
    }
    labels
}

fn label<'a>(labels: &'a HashMap<String, String>, key: &str) -> &'a str {
    labels.get(key).map(String::as_str).unwrap_or_default()
}

fn code_from_name(name: &str) -> &'static str {
    ALL_CODES
        .iter()
        .map(|code| code_name(*code))
        .find(|known| *known == name)
        .unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_HANDLING_BUCKETS;

    fn metrics(name: &str) -> ServerMetrics {
        ServerMetrics::register(&Registry::new(), name, &DEFAULT_HANDLING_BUCKETS).unwrap()
    }

    #[test]
    fn test_sanitize_namespace() {
        assert_eq!(sanitize_namespace("room"), "room");
        assert_eq!(sanitize_namespace("room-service"), "room_service");
        assert_eq!(sanitize_namespace("chat.v1"), "chat_v1");
        assert_eq!(sanitize_namespace("1chat"), "_1chat");
    }

    #[test]
    fn test_code_names() {
        assert_eq!(code_name(tonic::Code::Ok), "OK");
        assert_eq!(code_name(tonic::Code::Cancelled), "Canceled");
        assert_eq!(code_name(tonic::Code::Unavailable), "Unavailable");
    }

    #[test]
    fn test_method_info() {
        let info = MethodInfo::server_stream("echo.EchoService", "Stream");
        assert_eq!(info.path(), "/echo.EchoService/Stream");
        assert!(info.kind.is_streaming());
        assert_eq!(info.kind.as_str(), "server_stream");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        ServerMetrics::register(&registry, "svc", &DEFAULT_HANDLING_BUCKETS).unwrap();
        let second = ServerMetrics::register(&registry, "svc", &DEFAULT_HANDLING_BUCKETS);
        assert!(matches!(second, Err(InfraError::Metrics(_))));
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = ServerMetrics::register(&Registry::new(), "", &DEFAULT_HANDLING_BUCKETS);
        assert!(matches!(result, Err(InfraError::Config(_))));
    }

    #[test]
    fn test_initialized_methods_are_exported_at_zero() {
        let metrics = metrics("svc");
        metrics.initialize_methods(&[
            MethodInfo::unary("echo.EchoService", "Echo"),
            MethodInfo::server_stream("echo.EchoService", "Stream"),
        ]);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains(
            r#"svc_grpc_server_started_total{grpc_method="Echo",grpc_service="echo.EchoService",grpc_type="unary",serviceID="svc"} 0"#
        ));
        assert!(text.contains(r#"grpc_code="DataLoss",grpc_method="Stream""#));
        assert_eq!(
            metrics.method_kind("echo.EchoService", "Stream"),
            MethodKind::ServerStream
        );
    }

    #[test]
    fn test_every_series_carries_service_id() {
        let metrics = metrics("svc");
        metrics.initialize_methods(&[MethodInfo::unary("echo.EchoService", "Echo")]);
        metrics.record_panic();

        let text = metrics.gather_text().unwrap();
        let samples: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert!(!samples.is_empty());
        for sample in samples {
            assert!(sample.contains(r#"serviceID="svc""#), "{}", sample);
        }
    }

    #[test]
    fn test_record_handled_observes_one_bucket() {
        let metrics = metrics("svc");
        metrics.record_started("echo.EchoService", "Echo");
        metrics.record_handled(
            "echo.EchoService",
            "Echo",
            tonic::Code::Ok,
            Duration::from_millis(50),
            None,
        );

        assert_eq!(metrics.started_count("echo.EchoService", "Echo"), 1);
        assert_eq!(
            metrics.handled_count("echo.EchoService", "Echo", tonic::Code::Ok),
            1
        );
        assert_eq!(metrics.handling_count("echo.EchoService", "Echo"), 1);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains(r#"serviceID="svc",le="0.01"} 0"#));
        assert!(text.contains(r#"serviceID="svc",le="0.1"} 1"#));
    }

    #[test]
    fn test_exemplar_only_for_sampled_calls() {
        let metrics = metrics("svc");
        metrics.record_handled(
            "echo.EchoService",
            "Echo",
            tonic::Code::Ok,
            Duration::from_millis(2),
            None,
        );
        assert!(metrics.exemplar("echo.EchoService", "Echo").is_none());

        metrics.record_handled(
            "echo.EchoService",
            "Echo",
            tonic::Code::Internal,
            Duration::from_millis(2),
            Some("4bf92f3577b34da6a3ce929d0e0e4736"),
        );
        let exemplar = metrics.exemplar("echo.EchoService", "Echo").unwrap();
        assert_eq!(exemplar.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn test_openmetrics_carries_trace_exemplars() {
        let metrics = metrics("svc");
        metrics.initialize_methods(&[MethodInfo::unary("echo.EchoService", "Echo")]);
        metrics.record_handled(
            "echo.EchoService",
            "Echo",
            tonic::Code::Internal,
            Duration::from_millis(2),
            Some("4bf92f3577b34da6a3ce929d0e0e4736"),
        );

        let text = metrics.gather_openmetrics().unwrap();
        assert!(text.contains("# TYPE svc_grpc_server_handled counter"));
        assert!(text.ends_with("# EOF\n"));

        let with_exemplar: Vec<&str> = text
            .lines()
            .filter(|l| l.contains(r#"# {traceID="4bf92f3577b34da6a3ce929d0e0e4736"}"#))
            .collect();
        assert_eq!(with_exemplar.len(), 2, "{}", text);
        assert!(with_exemplar[0].starts_with("svc_grpc_server_handled_total{"));
        assert!(with_exemplar[0].contains(r#"grpc_code="Internal""#));
        assert!(with_exemplar[1].starts_with("svc_grpc_server_handling_seconds_bucket{"));
        assert!(with_exemplar[1].contains(r#"le="0.01""#));
        assert!(with_exemplar[1].contains("} 1 # {traceID="));

        // The Prometheus text scrape is unchanged.
        assert!(!metrics.gather_text().unwrap().contains("traceID"));
    }

    #[test]
    fn test_openmetrics_without_samples_has_no_exemplars() {
        let metrics = metrics("svc");
        metrics.initialize_methods(&[MethodInfo::unary("echo.EchoService", "Echo")]);
        metrics.record_handled(
            "echo.EchoService",
            "Echo",
            tonic::Code::Ok,
            Duration::from_millis(2),
            None,
        );

        let text = metrics.gather_openmetrics().unwrap();
        assert!(!text.contains("traceID"));
    }

    #[test]
    fn test_parse_labels_unescapes_values() {
        let labels = parse_labels(r#"a="x",b="say \"hi\"",le="+Inf""#);
        assert_eq!(labels["a"], "x");
        assert_eq!(labels["b"], r#"say "hi""#);
        assert_eq!(labels["le"].parse::<f64>().unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_message_counters() {
        let metrics = metrics("svc");
        metrics.initialize_methods(&[MethodInfo::server_stream("echo.EchoService", "Stream")]);
        metrics.record_msg_received("echo.EchoService", "Stream", 1);
        metrics.record_msg_sent("echo.EchoService", "Stream", 3);

        assert_eq!(metrics.msg_received_count("echo.EchoService", "Stream"), 1);
        assert_eq!(metrics.msg_sent_count("echo.EchoService", "Stream"), 3);
        let text = metrics.gather_text().unwrap();
        assert!(text.contains(
            r#"svc_grpc_server_msg_sent_total{grpc_method="Stream",grpc_service="echo.EchoService",grpc_type="server_stream",serviceID="svc"} 3"#
        ));
    }

    #[test]
    fn test_panic_counter() {
        let metrics = metrics("svc");
        assert_eq!(metrics.panics_recovered(), 0);
        metrics.record_panic();
        assert_eq!(metrics.panics_recovered(), 1);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains(r#"svc_grpc_req_panics_recovered_total{serviceID="svc"} 1"#));
    }
}
