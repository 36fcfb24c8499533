// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{peer_address, CallInfo, FinishHook, ObservedBody};
use crate::runtime::tracing::{
    extract_context, finish_server_span, start_server_span, RpcSpan,
};
use http::{Request, Response};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::instrument::Instrumented;
use tracing::Instrument;

/// Trace context extracted from the inbound metadata of a call.
///
/// Stored in the request extensions for the layers and handlers below.
#[derive(Debug, Clone)]
pub struct TraceContext(pub opentelemetry::Context);

/// Extracts the caller's trace context, starts the server span under it and
/// runs the call inside that span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl TraceLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TraceService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = TraceResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let info = CallInfo::from_path(req.uri().path());
        let parent = extract_context(req.headers());
        let otel_cx = start_server_span(&parent, &info.service, &info.method);
        let rpc_span = RpcSpan::server(&info.service, &info.method, &peer_address(&req));
        req.extensions_mut().insert(TraceContext(otel_cx.clone()));

        let span = rpc_span.span().clone();
        TraceResponseFuture {
            inner: self.inner.call(req).instrument(span),
            otel_cx,
            rpc_span: Some(rpc_span),
        }
    }
}

pin_project! {
    /// Polls the inner call with the extracted context attached.
    pub struct TraceResponseFuture<F> {
        #[pin]
        inner: Instrumented<F>,
        otel_cx: opentelemetry::Context,
        rpc_span: Option<RpcSpan>,
    }
}

impl<F, ResBody, E> Future for TraceResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ObservedBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let polled = {
            let _attached = this.otel_cx.clone().attach();
            this.inner.poll(cx)
        };
        match polled {
            Poll::Ready(Ok(response)) => {
                let rpc_span = this.rpc_span.take();
                let otel_cx = this.otel_cx.clone();
                let hook: FinishHook = Box::new(move |code: tonic::Code| {
                    if let Some(rpc_span) = rpc_span {
                        rpc_span.record_grpc_status(code);
                    }
                    finish_server_span(&otel_cx, code);
                });
                Poll::Ready(Ok(ObservedBody::wrap(response, hook)))
            }
            Poll::Ready(Err(e)) => {
                if let Some(rpc_span) = this.rpc_span.take() {
                    rpc_span.record_grpc_status(tonic::Code::Unknown);
                }
                finish_server_span(this.otel_cx, tonic::Code::Unknown);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tracing::sampled_trace_id;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use tower::{service_fn, ServiceExt};

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    async fn trace_id_seen_by_handler(traceparent: Option<&str>) -> Option<String> {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let handler = service_fn(move |req: Request<tonic::body::Body>| {
            let captured = captured.clone();
            async move {
                let from_extension = req
                    .extensions()
                    .get::<TraceContext>()
                    .and_then(|cx| sampled_trace_id(&cx.0));
                assert_eq!(
                    from_extension,
                    sampled_trace_id(&opentelemetry::Context::current())
                );
                *captured.lock().unwrap() = from_extension;
                Ok::<_, Infallible>(Response::new(tonic::body::Body::empty()))
            }
        });

        let mut builder = Request::builder().uri("/echo.EchoService/Echo");
        if let Some(traceparent) = traceparent {
            builder = builder.header("traceparent", traceparent);
        }
        let req = builder.body(tonic::body::Body::empty()).unwrap();

        TraceLayer::new().layer(handler).oneshot(req).await.unwrap();
        let id = seen.lock().unwrap().clone();
        id
    }

    #[tokio::test]
    async fn test_server_span_roots_and_continues_traces() {
        opentelemetry::global::set_tracer_provider(SdkTracerProvider::builder().build());

        let root = trace_id_seen_by_handler(None).await;
        let root = root.expect("a root trace is started without traceparent");
        assert_eq!(root.len(), 32);
        assert_ne!(root, "4bf92f3577b34da6a3ce929d0e0e4736");

        let child = trace_id_seen_by_handler(Some(TRACEPARENT)).await;
        assert_eq!(child.as_deref(), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
    }
}
