// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::logging::Logger;
use crate::runtime::metrics::ServerMetrics;
use futures::future::{CatchUnwind, FutureExt};
use http::{HeaderMap, Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower::{Layer, Service};

/// Turns a handler panic into an `Internal` status carrying the panic
/// message.
///
/// Every recovered panic increments the panic counter and is logged with
/// its stack at error level. Panics raised while a response stream is
/// produced end the stream with `Internal` trailers.
#[derive(Debug, Clone)]
pub struct RecoveryLayer {
    recovery: Recovery,
}

impl RecoveryLayer {
    pub fn new(metrics: ServerMetrics, logger: Logger) -> Self {
        Self {
            recovery: Recovery { metrics, logger },
        }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            recovery: self.recovery.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recovery {
    metrics: ServerMetrics,
    logger: Logger,
}

impl Recovery {
    fn recover(&self, payload: Box<dyn Any + Send>) -> tonic::Status {
        self.metrics.record_panic();
        let message = panic_message(payload.as_ref());
        let stack = Backtrace::force_capture();
        self.logger.error(
            &format!("recovered from panic, stack: {}", stack),
            &[("panic", &message)],
        );
        tonic::Status::internal(message)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
    recovery: Recovery,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Default,
{
    type Response = Response<RecoveryBody<ResBody>>;
    type Error = S::Error;
    type Future = RecoveryFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let inner = &mut self.inner;
        match panic::catch_unwind(AssertUnwindSafe(move || inner.call(req))) {
            Ok(future) => RecoveryFuture::Running {
                inner: AssertUnwindSafe(future).catch_unwind(),
                recovery: self.recovery.clone(),
            },
            Err(payload) => RecoveryFuture::Recovered {
                status: Some(self.recovery.recover(payload)),
            },
        }
    }
}

pin_project! {
    #[project = RecoveryFutureProj]
    pub enum RecoveryFuture<F> {
        Running {
            #[pin]
            inner: CatchUnwind<AssertUnwindSafe<F>>,
            recovery: Recovery,
        },
        Recovered {
            status: Option<tonic::Status>,
        },
    }
}

impl<F, ResBody, E> Future for RecoveryFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    ResBody: Default,
{
    type Output = Result<Response<RecoveryBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RecoveryFutureProj::Running { inner, recovery } => match ready!(inner.poll(cx)) {
                Ok(Ok(response)) => {
                    let recovery = recovery.clone();
                    Poll::Ready(Ok(response.map(|body| RecoveryBody::guarded(body, recovery))))
                }
                Ok(Err(e)) => Poll::Ready(Err(e)),
                Err(payload) => Poll::Ready(Ok(recovery.recover(payload).into_http())),
            },
            RecoveryFutureProj::Recovered { status } => {
                let status = status
                    .take()
                    .unwrap_or_else(|| tonic::Status::internal("recovery future polled twice"));
                Poll::Ready(Ok(status.into_http()))
            }
        }
    }
}

pin_project! {
    /// Response body that ends the stream with `Internal` trailers when
    /// producing the next frame panics.
    pub struct RecoveryBody<B> {
        #[pin]
        inner: B,
        recovery: Option<Recovery>,
        failed: bool,
    }
}

impl<B> RecoveryBody<B> {
    fn guarded(inner: B, recovery: Recovery) -> Self {
        Self {
            inner,
            recovery: Some(recovery),
            failed: false,
        }
    }
}

impl<B: Default> Default for RecoveryBody<B> {
    fn default() -> Self {
        Self {
            inner: B::default(),
            recovery: None,
            failed: false,
        }
    }
}

impl<B: Body> Body for RecoveryBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.failed {
            return Poll::Ready(None);
        }
        let Some(recovery) = this.recovery.as_ref() else {
            return this.inner.poll_frame(cx);
        };

        let inner = &mut this.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll_frame(cx))) {
            Ok(polled) => polled,
            Err(payload) => {
                *this.failed = true;
                let status = recovery.recover(payload);
                let mut trailers = HeaderMap::new();
                if status.add_header(&mut trailers).is_err() {
                    trailers.insert(
                        http::HeaderName::from_static("grpc-status"),
                        http::HeaderValue::from(tonic::Code::Internal as i32),
                    );
                }
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.failed {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
