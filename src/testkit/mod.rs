// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process test peers.
//!
//! [`EchoServer`] implements `echo.EchoService` with a unary `Echo` and a
//! server-streaming `Stream` method. Requests script its behaviour: fail
//! with a code, panic, or take their time. Failures can also be queued up
//! front with [`EchoServer::fail_next`] to exercise client retries.
//! [`LogBuffer`] captures logger output in memory.

use crate::client::SERVICE_ID_HEADER;
use crate::config::ServerConfig;
use crate::runtime::metrics::MethodInfo;
use crate::runtime::tracing::sampled_trace_id;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tonic::body::Body;
use tonic::server::{Grpc, NamedService};
use tonic::{Code, Request, Response, Status};
use tonic_prost::ProstCodec;
use tracing_subscriber::fmt::MakeWriter;

/// Fully qualified name of the echo service.
pub const ECHO_SERVICE: &str = "echo.EchoService";
/// Path of the unary method.
pub const ECHO_PATH: &str = "/echo.EchoService/Echo";
/// Path of the server-streaming method.
pub const STREAM_PATH: &str = "/echo.EchoService/Stream";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
    /// Replies sent by `Stream`.
    #[prost(uint32, tag = "2")]
    pub count: u32,
    /// Wait before the reply, or before each streamed reply.
    #[prost(uint64, tag = "3")]
    pub delay_ms: u64,
    /// Non-zero fails the call with this code and `message`.
    #[prost(int32, tag = "4")]
    pub fail_code: i32,
    /// Panic with `message` instead of replying. `Stream` panics after its
    /// first reply.
    #[prost(bool, tag = "5")]
    pub panic: bool,
    /// Filler to size the request. Only its length is echoed back.
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
}

impl EchoRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            count: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn failing_with(mut self, code: Code) -> Self {
        self.fail_code = code as i32;
        self
    }

    /// Pad the request with `len` bytes.
    #[must_use]
    pub fn with_payload(mut self, len: usize) -> Self {
        self.payload = vec![0; len];
        self
    }

    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoReply {
    #[prost(string, tag = "1")]
    pub message: String,
    /// `service-id` header the call arrived with.
    #[prost(string, tag = "2")]
    pub service_id: String,
    /// Sampled trace id active in the handler.
    #[prost(string, tag = "3")]
    pub trace_id: String,
    /// Calls the server had received when this one arrived.
    #[prost(uint32, tag = "4")]
    pub call: u32,
    /// Position within a stream.
    #[prost(uint32, tag = "5")]
    pub index: u32,
    #[prost(uint64, tag = "6")]
    pub payload_len: u64,
}

#[derive(Debug, Default)]
struct EchoState {
    calls: AtomicU32,
    failures: Mutex<VecDeque<Code>>,
}

impl EchoState {
    /// Count the call and return the scripted failure for it, if any.
    fn admit(&self) -> (u32, Option<Code>) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        (call, failure)
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Scriptable `echo.EchoService` server.
#[derive(Debug, Clone)]
pub struct EchoServer {
    state: Arc<EchoState>,
    max_recv_msg_size: usize,
}

impl Default for EchoServer {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            max_recv_msg_size: ServerConfig::default().max_recv_msg_size,
        }
    }
}

impl EchoServer {
    /// Methods to register with the server.
    #[must_use]
    pub fn methods() -> Vec<MethodInfo> {
        vec![
            MethodInfo::unary(ECHO_SERVICE, "Echo"),
            MethodInfo::server_stream(ECHO_SERVICE, "Stream"),
        ]
    }

    /// Limit decoded request size. [`RpcServer::add_service`] passes the
    /// server's configured limit here.
    ///
    /// [`RpcServer::add_service`]: crate::server::RpcServer::add_service
    #[must_use]
    pub fn with_max_recv_msg_size(mut self, limit: usize) -> Self {
        self.max_recv_msg_size = limit;
        self
    }

    /// Fail the next `times` calls with `code` before looking at the request.
    pub fn fail_next(&self, times: u32, code: Code) {
        let mut failures = self
            .state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        failures.extend(std::iter::repeat(code).take(times as usize));
    }

    /// Calls received so far, across both methods.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    fn grpc(&self) -> Grpc<ProstCodec<EchoReply, EchoRequest>> {
        Grpc::new(ProstCodec::default())
            .apply_max_message_size_config(Some(self.max_recv_msg_size), None)
    }

    async fn echo(
        state: Arc<EchoState>,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoReply>, Status> {
        let (call, failure) = state.admit();
        if let Some(code) = failure {
            return Err(Status::new(code, "scripted failure"));
        }
        let service_id = caller_id(&request);
        let req = request.into_inner();
        check(&req)?;
        if req.panic {
            panic!("{}", req.message);
        }
        if req.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(req.delay_ms)).await;
        }

        Ok(Response::new(EchoReply {
            message: req.message,
            service_id,
            trace_id: current_trace_id(),
            call,
            index: 0,
            payload_len: req.payload.len() as u64,
        }))
    }

    async fn stream(
        state: Arc<EchoState>,
        request: Request<EchoRequest>,
    ) -> Result<Response<BoxStream<'static, Result<EchoReply, Status>>>, Status> {
        let (call, failure) = state.admit();
        if let Some(code) = failure {
            return Err(Status::new(code, "scripted failure"));
        }
        let service_id = caller_id(&request);
        let req = request.into_inner();
        check(&req)?;

        let trace_id = current_trace_id();
        let payload_len = req.payload.len() as u64;
        let delay = Duration::from_millis(req.delay_ms);
        let replies = stream::iter(0..req.count)
            .then(move |index| {
                let reply = EchoReply {
                    message: req.message.clone(),
                    service_id: service_id.clone(),
                    trace_id: trace_id.clone(),
                    call,
                    index,
                    payload_len,
                };
                let panic = req.panic && index > 0;
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if panic {
                        panic!("{}", reply.message);
                    }
                    Ok(reply)
                }
            })
            .boxed();
        Ok(Response::new(replies))
    }
}

fn check(req: &EchoRequest) -> Result<(), Status> {
    if req.fail_code == 0 {
        return Ok(());
    }
    Err(Status::new(Code::from(req.fail_code), req.message.clone()))
}

fn caller_id<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get(SERVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn current_trace_id() -> String {
    sampled_trace_id(&opentelemetry::Context::current()).unwrap_or_default()
}

impl NamedService for EchoServer {
    const NAME: &'static str = ECHO_SERVICE;
}

impl tower::Service<http::Request<Body>> for EchoServer {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let mut grpc = self.grpc();
        let state = self.state.clone();
        match req.uri().path() {
            ECHO_PATH => Box::pin(async move {
                let method = tower::service_fn(move |request: Request<EchoRequest>| {
                    Self::echo(state.clone(), request)
                });
                Ok::<_, Infallible>(grpc.unary(method, req).await)
            }),
            STREAM_PATH => Box::pin(async move {
                let method = tower::service_fn(move |request: Request<EchoRequest>| {
                    Self::stream(state.clone(), request)
                });
                Ok::<_, Infallible>(grpc.server_streaming(method, req).await)
            }),
            _ => Box::pin(async move { Ok(Status::unimplemented("").into_http::<Body>()) }),
        }
    }
}

/// In-memory sink for logger output.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    pub fn clear(&self) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Writer handed out by [`LogBuffer`].
#[derive(Debug)]
pub struct LogBufferWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter {
            buf: self.buf.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_buffer_collects_lines() {
        let buffer = LogBuffer::new();
        let mut writer = buffer.make_writer();
        writer.write_all(b"first\nsecond\n").unwrap();

        assert_eq!(buffer.lines(), vec!["first", "second"]);
        buffer.clear();
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_methods() {
        let methods = EchoServer::methods();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].path(), ECHO_PATH);
        assert_eq!(methods[1].path(), STREAM_PATH);
        assert!(methods[1].kind.is_streaming());
    }

    #[tokio::test]
    async fn test_scripted_failures_come_first() {
        let server = EchoServer::default();
        server.fail_next(2, Code::Unavailable);

        for _ in 0..2 {
            let err = EchoServer::echo(server.state.clone(), Request::new(EchoRequest::new("hi")))
                .await
                .unwrap_err();
            assert_eq!(err.code(), Code::Unavailable);
        }
        let reply = EchoServer::echo(server.state.clone(), Request::new(EchoRequest::new("hi")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.message, "hi");
        assert_eq!(reply.call, 3);
        assert_eq!(server.calls(), 3);
    }

    #[tokio::test]
    async fn test_request_fail_code() {
        let server = EchoServer::default();
        let request = EchoRequest::new("denied").failing_with(Code::PermissionDenied);

        let err = EchoServer::echo(server.state.clone(), Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(err.message(), "denied");
    }

    #[tokio::test]
    async fn test_echo_reports_caller_id() {
        let server = EchoServer::default();
        let mut request = Request::new(EchoRequest::new("hi"));
        request
            .metadata_mut()
            .insert(SERVICE_ID_HEADER, "gateway".parse().unwrap());

        let reply = EchoServer::echo(server.state.clone(), request)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.service_id, "gateway");
        assert!(reply.trace_id.is_empty());
    }

    #[tokio::test]
    async fn test_stream_yields_count_replies() {
        let server = EchoServer::default();
        let request = EchoRequest::new("tick").with_count(3);

        let replies: Vec<_> = EchoServer::stream(server.state.clone(), Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .collect()
            .await;

        assert_eq!(replies.len(), 3);
        let indices: Vec<u32> = replies.into_iter().map(|r| r.unwrap().index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
