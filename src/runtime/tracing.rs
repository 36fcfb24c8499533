// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trace context propagation and RPC spans.
//!
//! Trace context travels in the W3C `traceparent`/`tracestate` headers. The
//! server extracts it from inbound metadata, the client injects the current
//! context into outbound metadata, and both sides read the sampled trace id
//! for log correlation and metric exemplars.
//!
//! Exporting spans is left to the embedding service: install an
//! OpenTelemetry tracer provider and a `tracing` subscriber with an
//! OpenTelemetry layer, and the spans created here flow to it.
//!
//! The server also opens an OpenTelemetry span per call through the global
//! tracer. With a provider installed, a call without a `traceparent` header
//! starts a new sampled root trace, so its logs and exemplars still carry a
//! trace id. Without a provider the global tracer is a no-op and only a
//! propagated parent yields a trace id.
//!
//! # Example
//!
//! ```rust
//! use chat_infra::runtime::tracing::{extract_context, sampled_trace_id};
//! use http::HeaderMap;
//!
//! let mut headers = HeaderMap::new();
//! headers.insert(
//!     "traceparent",
//!     "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".parse().unwrap(),
//! );
//!
//! let cx = extract_context(&headers);
//! assert_eq!(
//!     sampled_trace_id(&cx).as_deref(),
//!     Some("4bf92f3577b34da6a3ce929d0e0e4736")
//! );
//! ```
//!
//! # Semantic Conventions
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `rpc.system` | Always "grpc" |
//! | `rpc.service` | Fully qualified service (e.g., "echo.EchoService") |
//! | `rpc.method` | Method name (e.g., "Echo") |
//! | `otel.kind` | "server" or "client" |
//! | `net.peer` | Remote address or dial target |
//! | `rpc.grpc.status_code` | gRPC status code |

use http::header::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{Span as _, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::time::{Duration, Instant};
use tracing::{field, info_span, Span};

/// Read-only view of request headers for context extraction.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Writable view of request headers for context injection.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            return;
        };
        self.0.insert(name, value);
    }
}

/// Trace context carried by the request headers. Missing or malformed
/// headers yield an empty context.
#[must_use]
pub fn extract_context(headers: &HeaderMap) -> Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

/// Write `cx` into the request headers.
pub fn inject_context(cx: &Context, headers: &mut HeaderMap) {
    TraceContextPropagator::new().inject_context(cx, &mut HeaderInjector(headers));
}

/// Hex trace id of `cx` if it carries a sampled span.
#[must_use]
pub fn sampled_trace_id(cx: &Context) -> Option<String> {
    let span = cx.span();
    let sc = span.span_context();
    (sc.is_valid() && sc.is_sampled()).then(|| sc.trace_id().to_string())
}

/// Instrumentation scope of the spans started here.
pub const TRACER_NAME: &str = "chat-infra";

/// Start the OpenTelemetry server span of a call as a child of `parent`.
///
/// Returns `parent` unchanged when the global tracer produced no recording
/// span context, which keeps a propagated parent intact under the no-op
/// tracer.
#[must_use]
pub fn start_server_span(parent: &Context, service: &str, method: &str) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(format!("{}/{}", service, method))
        .with_kind(opentelemetry::trace::SpanKind::Server)
        .with_attributes([
            KeyValue::new("rpc.system", "grpc"),
            KeyValue::new("rpc.service", service.to_string()),
            KeyValue::new("rpc.method", method.to_string()),
        ])
        .start_with_context(&tracer, parent);

    if span.span_context().is_valid() {
        parent.with_span(span)
    } else {
        parent.clone()
    }
}

/// Record the call's status on the span in `cx` and end it.
pub fn finish_server_span(cx: &Context, code: tonic::Code) {
    if !cx.has_active_span() {
        return;
    }
    let span = cx.span();
    span.set_attribute(KeyValue::new("rpc.grpc.status_code", code as i64));
    if code != tonic::Code::Ok {
        span.set_status(Status::error(format!("{:?}", code)));
    }
    span.end();
}

/// Side of the call a span describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Client,
}

impl SpanKind {
    fn as_str(self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
        }
    }
}

/// A span around one RPC, carrying the OpenTelemetry attributes above.
#[derive(Debug)]
pub struct RpcSpan {
    span: Span,
    start: Instant,
    service: String,
    method: String,
}

impl RpcSpan {
    pub fn new(kind: SpanKind, service: &str, method: &str, peer: &str) -> Self {
        let span = info_span!(
            "grpc",
            otel.name = %format_args!("{}/{}", service, method),
            otel.kind = kind.as_str(),
            rpc.system = "grpc",
            rpc.service = %service,
            rpc.method = %method,
            net.peer = %peer,
            rpc.grpc.status_code = field::Empty,
            otel.status_code = field::Empty,
            duration_ms = field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    pub fn server(service: &str, method: &str, peer: &str) -> Self {
        Self::new(SpanKind::Server, service, method, peer)
    }

    pub fn client(service: &str, method: &str, target: &str) -> Self {
        Self::new(SpanKind::Client, service, method, target)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the final status of the call.
    pub fn record_grpc_status(&self, code: tonic::Code) {
        self.span.record("rpc.grpc.status_code", code as i64);
        let status = if code == tonic::Code::Ok { "OK" } else { "ERROR" };
        self.span.record("otel.status_code", status);
        self.span
            .record("duration_ms", self.start.elapsed().as_millis() as i64);
    }
}
