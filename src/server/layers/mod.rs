// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tower layers forming the server interceptor chain.
//!
//! Applied outermost first: [`TraceLayer`], [`MetricsLayer`],
//! [`LoggingLayer`], [`RecoveryLayer`]. Each layer sees the final status of a
//! call through [`ObservedBody`], which reports the `grpc-status` carried by
//! the response headers (trailers-only responses) or trailers, so unary and
//! streaming calls are observed the same way.

mod logging;
mod metrics;
mod recovery;
mod trace;

pub use logging::{finish_level, LoggingLayer, LoggingService};
pub use metrics::{MetricsLayer, MetricsService};
pub use recovery::{RecoveryBody, RecoveryLayer, RecoveryService};
pub use trace::{TraceContext, TraceLayer, TraceService};

use bytes::{Buf, Bytes};
use http::{HeaderMap, Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tonic::transport::server::TcpConnectInfo;

/// Called once with the final status code of a call.
pub type FinishHook = Box<dyn FnOnce(tonic::Code) + Send + 'static>;

/// Called with the number of messages found in each data frame.
pub type MessageHook = Box<dyn FnMut(u64) + Send + 'static>;

/// Length of the prefix in front of every gRPC message.
const MESSAGE_PREFIX_LEN: usize = 5;

/// Finds gRPC message boundaries in a byte stream split at arbitrary
/// points.
#[derive(Debug, Default)]
struct MessageFramer {
    prefix: [u8; MESSAGE_PREFIX_LEN],
    prefix_len: usize,
    remaining: usize,
}

impl MessageFramer {
    /// Consume `chunk` and return how many message prefixes it completed.
    fn feed(&mut self, mut chunk: &[u8]) -> u64 {
        let mut messages = 0;
        while !chunk.is_empty() {
            if self.remaining > 0 {
                let skip = self.remaining.min(chunk.len());
                self.remaining -= skip;
                chunk = &chunk[skip..];
                continue;
            }
            let take = (MESSAGE_PREFIX_LEN - self.prefix_len).min(chunk.len());
            self.prefix[self.prefix_len..self.prefix_len + take].copy_from_slice(&chunk[..take]);
            self.prefix_len += take;
            chunk = &chunk[take..];
            if self.prefix_len == MESSAGE_PREFIX_LEN {
                let [_, a, b, c, d] = self.prefix;
                self.remaining = u32::from_be_bytes([a, b, c, d]) as usize;
                self.prefix_len = 0;
                messages += 1;
            }
        }
        messages
    }
}

/// Service and method of a call, parsed from `/<service>/<method>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub service: String,
    pub method: String,
}

impl CallInfo {
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        match trimmed.rsplit_once('/') {
            Some((service, method)) => Self {
                service: service.to_string(),
                method: method.to_string(),
            },
            None => Self {
                service: "unknown".to_string(),
                method: trimmed.to_string(),
            },
        }
    }
}

/// Remote address of the connection a request arrived on.
pub(crate) fn peer_address<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<TcpConnectInfo>()
        .and_then(TcpConnectInfo::remote_addr)
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

fn header_code(headers: &HeaderMap) -> Option<tonic::Code> {
    tonic::Status::from_header_map(headers).map(|status| status.code())
}

pin_project! {
    /// Response body that reports the call's final status code to a hook.
    ///
    /// The hook fires on the trailers, at the end of a body without
    /// trailers (`Ok`), on a body error (`Unknown`), or when the body is
    /// dropped before completion (`Cancelled`).
    pub struct ObservedBody<B> {
        #[pin]
        inner: B,
        on_finish: Option<FinishHook>,
    }

    impl<B> PinnedDrop for ObservedBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(hook) = this.on_finish.take() {
                hook(tonic::Code::Cancelled);
            }
        }
    }
}

impl<B> ObservedBody<B> {
    /// Wrap a response body. A status already present in the response
    /// headers is reported at once.
    pub fn wrap(response: Response<B>, hook: FinishHook) -> Response<ObservedBody<B>> {
        let on_finish = match header_code(response.headers()) {
            Some(code) => {
                hook(code);
                None
            }
            None => Some(hook),
        };
        response.map(|inner| ObservedBody { inner, on_finish })
    }

    fn finish(on_finish: &mut Option<FinishHook>, code: tonic::Code) {
        if let Some(hook) = on_finish.take() {
            hook(code);
        }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body,
    B::Data: Buf,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(trailers) = frame.trailers_ref() {
                    let code = header_code(trailers).unwrap_or(tonic::Code::Ok);
                    Self::finish(this.on_finish, code);
                }
            }
            Some(Err(_)) => Self::finish(this.on_finish, tonic::Code::Unknown),
            None => Self::finish(this.on_finish, tonic::Code::Ok),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.on_finish.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Body that counts the gRPC messages carried by its data frames.
    pub struct CountedBody<B> {
        #[pin]
        inner: B,
        framer: MessageFramer,
        on_messages: MessageHook,
    }
}

impl<B> CountedBody<B> {
    pub fn new(inner: B, on_messages: MessageHook) -> Self {
        Self {
            inner,
            framer: MessageFramer::default(),
            on_messages,
        }
    }
}

impl<B> Body for CountedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));
        if let Some(Ok(frame)) = &polled {
            if let Some(data) = frame.data_ref() {
                let messages = this.framer.feed(data);
                if messages > 0 {
                    (this.on_messages)(messages);
                }
            }
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    struct Frames(VecDeque<Frame<Bytes>>);

    impl Body for Frames {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(self.0.pop_front().map(Ok))
        }
    }

    fn frames(frames: Vec<Frame<Bytes>>) -> Frames {
        Frames(frames.into())
    }

    async fn drain<B: Body>(body: B) {
        let mut body = std::pin::pin!(body);
        while futures::future::poll_fn(|cx| body.as_mut().poll_frame(cx))
            .await
            .is_some()
        {}
    }

    fn recorder() -> (Arc<Mutex<Vec<tonic::Code>>>, FinishHook) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: FinishHook = Box::new(move |code| sink.lock().unwrap().push(code));
        (seen, hook)
    }

    #[test]
    fn test_call_info_from_path() {
        let info = CallInfo::from_path("/echo.EchoService/Echo");
        assert_eq!(info.service, "echo.EchoService");
        assert_eq!(info.method, "Echo");

        let info = CallInfo::from_path("NoSlash");
        assert_eq!(info.service, "unknown");
        assert_eq!(info.method, "NoSlash");
    }

    #[test]
    fn test_trailers_only_response_reports_immediately() {
        let (seen, hook) = recorder();
        let response = tonic::Status::permission_denied("nope").into_http::<tonic::body::Body>();
        let observed = ObservedBody::wrap(response, hook);
        assert_eq!(*seen.lock().unwrap(), vec![tonic::Code::PermissionDenied]);
        drop(observed);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trailers_report_status() {
        let (seen, hook) = recorder();
        let mut trailers = HeaderMap::new();
        tonic::Status::unavailable("down")
            .add_header(&mut trailers)
            .unwrap();
        let body = frames(vec![
            Frame::data(Bytes::from_static(b"x")),
            Frame::trailers(trailers),
        ]);

        let observed = ObservedBody::wrap(Response::new(body), hook);
        drain(observed.into_body()).await;
        assert_eq!(*seen.lock().unwrap(), vec![tonic::Code::Unavailable]);
    }

    #[tokio::test]
    async fn test_end_without_trailers_is_ok() {
        let (seen, hook) = recorder();
        let body = frames(vec![Frame::data(Bytes::from_static(b"x"))]);
        let observed = ObservedBody::wrap(Response::new(body), hook);
        drain(observed.into_body()).await;
        assert_eq!(*seen.lock().unwrap(), vec![tonic::Code::Ok]);
    }

    fn message(len: u32) -> Vec<u8> {
        let mut framed = vec![0];
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend(std::iter::repeat(7).take(len as usize));
        framed
    }

    #[test]
    fn test_framer_counts_split_messages() {
        let mut stream = message(3);
        stream.extend(message(0));
        stream.extend(message(600));

        let mut framer = MessageFramer::default();
        let total: u64 = stream.chunks(4).map(|chunk| framer.feed(chunk)).sum();
        assert_eq!(total, 3);

        let mut framer = MessageFramer::default();
        assert_eq!(framer.feed(&stream), 3);
    }

    #[tokio::test]
    async fn test_counted_body_reports_messages() {
        let seen = Arc::new(Mutex::new(0u64));
        let sink = seen.clone();
        let mut two = message(2);
        two.extend(message(1));
        let body = frames(vec![
            Frame::data(Bytes::from(two)),
            Frame::data(Bytes::from(message(4))),
            Frame::trailers(HeaderMap::new()),
        ]);

        let counted = CountedBody::new(body, Box::new(move |n: u64| *sink.lock().unwrap() += n));
        drain(counted).await;
        assert_eq!(*seen.lock().unwrap(), 3);
    }

    #[test]
    fn test_dropped_body_is_cancelled() {
        let (seen, hook) = recorder();
        let body = frames(vec![Frame::data(Bytes::from_static(b"x"))]);
        drop(ObservedBody::wrap(Response::new(body), hook));
        assert_eq!(*seen.lock().unwrap(), vec![tonic::Code::Cancelled]);
    }
}
