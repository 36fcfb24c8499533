// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{peer_address, CallInfo, FinishHook, ObservedBody, TraceContext};
use crate::logging::{Field, LogLevel, Logger};
use crate::runtime::metrics::{code_name, MethodInfo, MethodKind};
use crate::runtime::tracing::sampled_trace_id;
use http::{Request, Response};
use pin_project_lite::pin_project;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower::{Layer, Service};

/// Severity of the record logged when a call finishes with `code`.
#[must_use]
pub fn finish_level(code: tonic::Code) -> LogLevel {
    use tonic::Code::*;
    match code {
        Ok | Cancelled | InvalidArgument | NotFound | AlreadyExists | Unauthenticated => {
            LogLevel::Info
        }
        DeadlineExceeded | PermissionDenied | ResourceExhausted | FailedPrecondition | Aborted
        | OutOfRange | Unavailable => LogLevel::Warn,
        Unknown | Unimplemented | Internal | DataLoss => LogLevel::Error,
    }
}

/// Logs a record when a call starts and when it finishes.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    logger: Logger,
    kinds: Arc<HashMap<String, MethodKind>>,
}

impl LoggingLayer {
    pub fn new(logger: Logger, methods: &[MethodInfo]) -> Self {
        let kinds = methods
            .iter()
            .map(|info| (info.path(), info.kind))
            .collect();
        Self {
            logger,
            kinds: Arc::new(kinds),
        }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            logger: self.logger.clone(),
            kinds: self.kinds.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingService<S> {
    inner: S,
    logger: Logger,
    kinds: Arc<HashMap<String, MethodKind>>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoggingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = LoggingResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let kind = self
            .kinds
            .get(req.uri().path())
            .copied()
            .unwrap_or_default();
        let record = CallRecord {
            logger: self.logger.clone(),
            info: CallInfo::from_path(req.uri().path()),
            kind,
            peer: peer_address(&req),
            trace_id: req
                .extensions()
                .get::<TraceContext>()
                .and_then(|cx| sampled_trace_id(&cx.0)),
            start: Instant::now(),
        };
        record.started();

        LoggingResponseFuture {
            inner: self.inner.call(req),
            record: Some(record),
        }
    }
}

struct CallRecord {
    logger: Logger,
    info: CallInfo,
    kind: MethodKind,
    peer: String,
    trace_id: Option<String>,
    start: Instant,
}

impl CallRecord {
    fn started(&self) {
        if !self.logger.enabled(LogLevel::Info) {
            return;
        }
        self.log(LogLevel::Info, "started call", None);
    }

    fn finished(self, code: tonic::Code) {
        let level = finish_level(code);
        if !self.logger.enabled(level) {
            return;
        }
        let time_ms = format!("{:.3}", self.start.elapsed().as_secs_f64() * 1000.0);
        self.log(level, "finished call", Some((code_name(code), time_ms)));
    }

    fn log(&self, level: LogLevel, msg: &str, outcome: Option<(&'static str, String)>) {
        let mut fields: Vec<Field<'_>> = vec![
            ("protocol", &"grpc"),
            ("grpc.component", &"server"),
            ("grpc.service", &self.info.service),
            ("grpc.method", &self.info.method),
            ("grpc.method_type", &self.kind),
            ("peer.address", &self.peer),
        ];
        if let Some((code, time_ms)) = outcome.as_ref() {
            fields.push(("grpc.code", code));
            fields.push(("grpc.time_ms", time_ms));
        }
        if let Some(trace_id) = &self.trace_id {
            fields.push(("traceID", trace_id));
        }
        self.logger.log(level, msg, &fields);
    }
}

pin_project! {
    pub struct LoggingResponseFuture<F> {
        #[pin]
        inner: F,
        record: Option<CallRecord>,
    }
}

impl<F, ResBody, E> Future for LoggingResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ObservedBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(response)) => {
                let record = this.record.take();
                let hook: FinishHook = Box::new(move |code: tonic::Code| {
                    if let Some(record) = record {
                        record.finished(code);
                    }
                });
                Poll::Ready(Ok(ObservedBody::wrap(response, hook)))
            }
            Poll::Ready(Err(e)) => {
                if let Some(record) = this.record.take() {
                    record.finished(tonic::Code::Unknown);
                }
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_levels() {
        assert_eq!(finish_level(tonic::Code::Ok), LogLevel::Info);
        assert_eq!(finish_level(tonic::Code::NotFound), LogLevel::Info);
        assert_eq!(finish_level(tonic::Code::Unavailable), LogLevel::Warn);
        assert_eq!(finish_level(tonic::Code::PermissionDenied), LogLevel::Warn);
        assert_eq!(finish_level(tonic::Code::Internal), LogLevel::Error);
        assert_eq!(finish_level(tonic::Code::Unknown), LogLevel::Error);
    }
}
