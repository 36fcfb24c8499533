// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{CallInfo, CountedBody, FinishHook, MessageHook, ObservedBody, TraceContext};
use crate::runtime::metrics::ServerMetrics;
use crate::runtime::tracing::sampled_trace_id;
use bytes::Bytes;
use http::{Request, Response};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower::{Layer, Service};

/// Records started/handled counters, the handling-time histogram and the
/// messages read and written by each call.
///
/// A sampled trace id found in the request extensions becomes the
/// exemplar of the observation.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    metrics: ServerMetrics,
}

impl MetricsLayer {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: ServerMetrics,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<tonic::body::Body>, Response = Response<ResBody>>,
    ReqBody: http_body::Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<ObservedBody<CountedBody<ResBody>>>;
    type Error = S::Error;
    type Future = MetricsResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let info = CallInfo::from_path(req.uri().path());
        let trace_id = req
            .extensions()
            .get::<TraceContext>()
            .and_then(|cx| sampled_trace_id(&cx.0));
        self.metrics.record_started(&info.service, &info.method);

        let received = message_hook(&self.metrics, &info, ServerMetrics::record_msg_received);
        let req = req.map(|body| tonic::body::Body::new(CountedBody::new(body, received)));

        MetricsResponseFuture {
            inner: self.inner.call(req),
            call: Some(Observation {
                metrics: self.metrics.clone(),
                info,
                trace_id,
                start: Instant::now(),
            }),
        }
    }
}

fn message_hook(
    metrics: &ServerMetrics,
    info: &CallInfo,
    record: fn(&ServerMetrics, &str, &str, u64),
) -> MessageHook {
    let metrics = metrics.clone();
    let info = info.clone();
    Box::new(move |messages| record(&metrics, &info.service, &info.method, messages))
}

struct Observation {
    metrics: ServerMetrics,
    info: CallInfo,
    trace_id: Option<String>,
    start: Instant,
}

impl Observation {
    fn finish(self, code: tonic::Code) {
        self.metrics.record_handled(
            &self.info.service,
            &self.info.method,
            code,
            self.start.elapsed(),
            self.trace_id.as_deref(),
        );
    }
}

pin_project! {
    pub struct MetricsResponseFuture<F> {
        #[pin]
        inner: F,
        call: Option<Observation>,
    }
}

impl<F, ResBody, E> Future for MetricsResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ObservedBody<CountedBody<ResBody>>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(response)) => {
                let call = this.call.take();
                let sent: MessageHook = match &call {
                    Some(call) => {
                        message_hook(&call.metrics, &call.info, ServerMetrics::record_msg_sent)
                    }
                    None => Box::new(|_: u64| {}),
                };
                let response = response.map(|body| CountedBody::new(body, sent));
                let hook: FinishHook = Box::new(move |code: tonic::Code| {
                    if let Some(call) = call {
                        call.finish(code);
                    }
                });
                Poll::Ready(Ok(ObservedBody::wrap(response, hook)))
            }
            Poll::Ready(Err(e)) => {
                if let Some(call) = this.call.take() {
                    call.finish(tonic::Code::Unknown);
                }
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
