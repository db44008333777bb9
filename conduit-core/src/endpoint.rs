//! C10 - Endpoint facade, wiring the frame codec, stream registry, method registry
//! and transport into the caller (C7) and responder (C8) runtimes.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::Codec;
use crate::error::{RpcError, StatusCode};
use crate::fsm::Event;
use crate::frame::Frame;
use crate::headers::{self, GRPC_MESSAGE, GRPC_STATUS, GRPC_TIMEOUT};
use crate::parser::encode_payload;
use crate::registry::{HandlerContext, MethodRegistry, ServiceContract};
use crate::stream::{StreamRegistry, StreamState, Trailer, DEFAULT_INBOX_CAPACITY};
use crate::stream_id::{Side, StreamIdManager};
use crate::transport::Transport;

/// Which role(s) this endpoint plays on its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Responder,
    Both,
}

/// Construction-time configuration (§4.10). No process-global state: every knob
/// lives here and is threaded through explicitly.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub max_message_size: usize,
    pub inbox_capacity: usize,
    pub global_high_water_mark: usize,
    pub close_grace_period: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_message_size: crate::parser::DEFAULT_MAX_MESSAGE_SIZE,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            global_high_water_mark: 4096,
            close_grace_period: Duration::from_secs(10),
        }
    }
}

pub struct Endpoint {
    transport: Transport,
    stream_ids: StreamIdManager,
    streams: StreamRegistry,
    methods: SyncMutex<MethodRegistry>,
    config: EndpointConfig,
    started: AtomicBool,
    closing: AtomicBool,
    read_loop: SyncMutex<Option<JoinHandle<()>>>,
    handler_tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn new(transport: Transport, role: Role, config: EndpointConfig) -> Arc<Self> {
        let side = match role {
            Role::Responder => Side::Responder,
            _ => Side::Caller,
        };
        Arc::new(Self {
            transport,
            stream_ids: StreamIdManager::new(side),
            streams: StreamRegistry::new(),
            methods: SyncMutex::new(MethodRegistry::new()),
            config,
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            read_loop: SyncMutex::new(None),
            handler_tasks: SyncMutex::new(Vec::new()),
        })
    }

    /// Register a service contract's methods. Must be called before `start`.
    pub fn register_service<S: ServiceContract>(
        &self,
        service: impl Into<String>,
        contract: &S,
    ) -> Result<(), crate::error::RegistryError> {
        self.methods.lock().register_service(service, contract)
    }

    /// Spawn the read loop that routes inbound frames to streams and dispatches
    /// new responder-side calls.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let endpoint = self.clone();
        let handle = tokio::spawn(async move {
            endpoint.run_read_loop().await;
        });
        *self.read_loop.lock() = Some(handle);
    }

    async fn run_read_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv_frame().await {
                Ok(Some(frame)) => self.handle_inbound_frame(frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "transport failed, tearing down endpoint");
                    break;
                }
            }
        }
        self.fail_all_streams(StatusCode::Unavailable, "transport closed");
    }

    async fn handle_inbound_frame(self: &Arc<Self>, frame: Frame) {
        let stream_id = frame.stream_id;

        if let Some(state) = self.streams.lookup(stream_id) {
            if frame.is_metadata() {
                let headers = headers::decode(frame.body.clone());
                if let Some(status_str) = headers::get(&headers, GRPC_STATUS) {
                    let status = status_str
                        .parse::<u32>()
                        .ok()
                        .and_then(StatusCode::from_u32)
                        .unwrap_or(StatusCode::Unknown);
                    let message = headers::get(&headers, GRPC_MESSAGE).map(|s| s.to_string());
                    let _ = state.apply(Event::RecvTrailer);
                    state.resolve_trailer(Trailer { status, message });
                    self.streams.remove(stream_id);
                    self.stream_ids.release_id(stream_id);
                } else if frame.end_of_stream() {
                    // A DATA-less, end-of-stream METADATA frame with no grpc-status
                    // is the caller-side cancel signal (§4.6): stop cooperatively.
                    tracing::debug!(stream_id, "peer cancelled stream");
                    state.cancel();
                } else {
                    tracing::debug!(stream_id, "ignoring unexpected non-trailer metadata frame");
                }
                return;
            }

            if let Err(e) = state.ingest(&frame.body).await {
                tracing::warn!(stream_id, error = %e, "message parser error");
                self.fail_stream(stream_id, &state, StatusCode::ResourceExhausted, e.to_string())
                    .await;
                return;
            }

            let total_buffered: usize = self.streams.all().iter().map(|s| s.buffered_len()).sum();
            if total_buffered > self.config.global_high_water_mark {
                tracing::warn!(
                    stream_id,
                    total_buffered,
                    high_water_mark = self.config.global_high_water_mark,
                    "global high-water mark breached, failing most recent offender"
                );
                self.fail_stream(
                    stream_id,
                    &state,
                    StatusCode::ResourceExhausted,
                    format!(
                        "endpoint-wide high-water mark of {} buffered messages breached",
                        self.config.global_high_water_mark
                    ),
                )
                .await;
                return;
            }

            if frame.end_of_stream() {
                let _ = state.apply(Event::RecvEos);
                state.close_inbox();
            }
            return;
        }

        if frame.is_metadata() && frame.method_path.is_some() {
            self.stream_ids.mark_active(stream_id);
            self.dispatch_new_call(stream_id, frame).await;
        } else {
            tracing::debug!(stream_id, "dropping frame for unknown stream");
        }
    }

    async fn dispatch_new_call(self: &Arc<Self>, stream_id: u32, frame: Frame) {
        let path = frame.method_path.clone().unwrap_or_default();
        let Some((service, method)) = crate::registry::parse_method_path(&path) else {
            self.send_trailer(stream_id, StatusCode::Unimplemented, format!("malformed method path {path}"))
                .await;
            return;
        };

        let descriptor = {
            let methods = self.methods.lock();
            methods
                .lookup(service, method)
                .map(|d| (d.handler.clone(), d.kind))
        };

        let Some((handler, _kind)) = descriptor else {
            self.send_trailer(
                stream_id,
                StatusCode::Unimplemented,
                format!("no such method {path}"),
            )
            .await;
            return;
        };

        let state = StreamState::new(stream_id, self.config.inbox_capacity, self.config.max_message_size);
        let _ = state.apply(Event::RecvMeta);
        self.streams.insert(state.clone());

        if frame.end_of_stream() {
            let _ = state.apply(Event::RecvEos);
            state.close_inbox();
        }

        let headers = headers::decode(frame.body.clone());
        let timeout = headers::get(&headers, GRPC_TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        let deadline = timeout.map(|d| Instant::now() + d);

        let ctx = HandlerContext {
            method_path: path,
            deadline,
            stream: state.clone(),
        };

        let endpoint = self.clone();
        let transport = self.transport.clone();
        let join = tokio::spawn(async move {
            let invocation = handler.invoke(transport, state.clone(), ctx);
            let (status, message) = match timeout {
                Some(budget) => match tokio::time::timeout(budget, invocation).await {
                    Ok(Ok(())) => (StatusCode::Ok, None),
                    Ok(Err(e)) => (e.code, e.message),
                    Err(_) => {
                        state.cancel();
                        (
                            StatusCode::DeadlineExceeded,
                            Some("handler exceeded its deadline".to_string()),
                        )
                    }
                },
                None => match invocation.await {
                    Ok(()) => (StatusCode::Ok, None),
                    Err(e) => (e.code, e.message),
                },
            };
            endpoint
                .send_trailer_message(stream_id, status, message)
                .await;
            endpoint.streams.remove(stream_id);
        });
        self.handler_tasks.lock().push(join);
    }

    async fn send_trailer(&self, stream_id: u32, status: StatusCode, message: impl Into<String>) {
        self.send_trailer_message(stream_id, status, Some(message.into()))
            .await;
    }

    async fn send_trailer_message(&self, stream_id: u32, status: StatusCode, message: Option<String>) {
        let mut header_list = vec![(GRPC_STATUS.to_string(), status.as_u32().to_string())];
        if let Some(msg) = message {
            header_list.push((GRPC_MESSAGE.to_string(), msg));
        }
        let body = headers::encode(&header_list);
        let frame = Frame::metadata(stream_id, None, body, true);
        if let Err(e) = self.transport.send_frame(frame).await {
            tracing::warn!(stream_id, error = %e, "failed to send trailer");
        }
    }

    /// Emit a DATA-less, end-of-stream METADATA frame telling the peer this stream
    /// is being torn down (§4.6's caller-side CANCEL signal). Best-effort: a failure
    /// here just means the peer finds out from the closed transport instead.
    async fn send_cancel_signal(&self, stream_id: u32) {
        let frame = Frame::metadata(stream_id, None, Bytes::new(), true);
        if let Err(e) = self.transport.send_frame(frame).await {
            tracing::debug!(stream_id, error = %e, "failed to send cancel signal");
        }
    }

    async fn fail_stream(
        &self,
        stream_id: u32,
        state: &Arc<StreamState>,
        status: StatusCode,
        message: impl Into<String>,
    ) {
        state.cancel();
        state.resolve_trailer(Trailer {
            status,
            message: Some(message.into()),
        });
        self.streams.remove(stream_id);
        self.stream_ids.release_id(stream_id);
    }

    fn fail_all_streams(&self, status: StatusCode, message: &str) {
        for state in self.streams.all() {
            state.cancel();
            state.resolve_trailer(Trailer {
                status,
                message: Some(message.to_string()),
            });
        }
    }

    /// Cancel every open stream, stop accepting new frames, and close the transport.
    pub async fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_all_streams(StatusCode::Cancelled, "endpoint closing");
        self.transport.close();

        let tasks: Vec<_> = self.handler_tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(self.config.close_grace_period, task)
                .await
                .is_err()
            {
                tracing::warn!("handler task exceeded close grace period, aborting");
            }
        }

        if let Some(handle) = self.read_loop.lock().take() {
            handle.abort();
        }
    }

    fn new_outbound_stream(&self) -> Arc<StreamState> {
        let id = self.stream_ids.generate_id();
        let state = StreamState::new(id, self.config.inbox_capacity, self.config.max_message_size);
        self.streams.insert(state.clone());
        state
    }

    async fn send_initial_metadata(
        &self,
        state: &Arc<StreamState>,
        path: &str,
        deadline: Option<Duration>,
    ) -> Result<(), RpcError> {
        state
            .apply(Event::SendMeta)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        let body = match deadline {
            Some(d) => headers::encode(&vec![(GRPC_TIMEOUT.to_string(), d.as_millis().to_string())]),
            None => Bytes::new(),
        };
        let frame = Frame::metadata(state.id, Some(path.to_string()), body, false);
        self.transport.send_frame(frame).await?;
        Ok(())
    }

    async fn send_request<Req, C>(
        &self,
        state: &Arc<StreamState>,
        req: &Req,
        end_of_stream: bool,
    ) -> Result<(), RpcError>
    where
        Req: Serialize,
        C: Codec,
    {
        let bytes = C::encode(req).map_err(|e| RpcError::internal(e.to_string()))?;
        let payload = encode_payload(0, &bytes);
        state
            .apply(Event::SendData)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if end_of_stream {
            state
                .apply(Event::FinishSend)
                .map_err(|e| RpcError::internal(e.to_string()))?;
        }
        let frame = Frame::data(state.id, payload, end_of_stream);
        self.transport.send_frame(frame).await?;
        Ok(())
    }

    async fn finish_sending(&self, state: &Arc<StreamState>) -> Result<(), RpcError> {
        state
            .apply(Event::FinishSend)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        let frame = Frame::data(state.id, Bytes::new(), true);
        self.transport.send_frame(frame).await?;
        Ok(())
    }

    async fn await_trailer(&self, state: &Arc<StreamState>) -> Trailer {
        match state.take_trailer_receiver().await {
            Some(rx) => rx.await.unwrap_or(Trailer {
                status: StatusCode::Unavailable,
                message: Some("endpoint closed before a trailer arrived".into()),
            }),
            None => Trailer {
                status: StatusCode::Internal,
                message: Some("trailer already consumed".into()),
            },
        }
    }

    fn release(&self, state: &Arc<StreamState>) {
        self.streams.remove(state.id);
        self.stream_ids.release_id(state.id);
    }

    // ---- C7: caller runtime ----

    /// Unary call: send one request, await exactly one response.
    pub async fn call_unary<Req, Resp, C>(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        req: Req,
        deadline: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        C: Codec,
    {
        let state = self.new_outbound_stream();
        let path = format!("/{service}/{method}");
        self.send_initial_metadata(&state, &path, deadline).await?;
        self.send_request::<Req, C>(&state, &req, true).await?;

        let mut inbox = state.take_inbox().await.ok_or_else(|| RpcError::internal("inbox taken twice"))?;
        let message = inbox.recv().await;
        let trailer = self.await_trailer(&state).await;
        self.release(&state);

        if trailer.status != StatusCode::Ok {
            return Err(RpcError {
                code: trailer.status,
                message: trailer.message,
            });
        }
        let bytes = message.ok_or_else(|| RpcError::internal("unary call completed with no response"))?;
        C::decode(&bytes).map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string()))
    }

    /// Server-streaming call: send one request, receive a stream of responses.
    pub async fn call_server_stream<Req, Resp, C>(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        req: Req,
        deadline: Option<Duration>,
    ) -> Result<ServerStreamCall<Resp, C>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        C: Codec,
    {
        let state = self.new_outbound_stream();
        let path = format!("/{service}/{method}");
        self.send_initial_metadata(&state, &path, deadline).await?;
        self.send_request::<Req, C>(&state, &req, true).await?;
        let inbox = state.take_inbox().await.ok_or_else(|| RpcError::internal("inbox taken twice"))?;

        Ok(ServerStreamCall {
            endpoint: self.clone(),
            state,
            inbox,
            trailer: None,
            released: false,
            _pd: PhantomData,
        })
    }

    /// Client-streaming call: send zero-or-more requests, then await one response.
    pub async fn open_client_stream<Req, Resp, C>(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        deadline: Option<Duration>,
    ) -> Result<ClientStreamCall<Req, Resp, C>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        C: Codec,
    {
        let state = self.new_outbound_stream();
        let path = format!("/{service}/{method}");
        self.send_initial_metadata(&state, &path, deadline).await?;

        Ok(ClientStreamCall {
            endpoint: self.clone(),
            state,
            finished: false,
            released: false,
            _pd: PhantomData,
        })
    }

    /// Bidi call: independent send/receive streams, both driven by the caller.
    pub async fn open_bidi<Req, Resp, C>(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        deadline: Option<Duration>,
    ) -> Result<BidiCall<Req, Resp, C>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        C: Codec,
    {
        let state = self.new_outbound_stream();
        let path = format!("/{service}/{method}");
        self.send_initial_metadata(&state, &path, deadline).await?;
        let inbox = state.take_inbox().await.ok_or_else(|| RpcError::internal("inbox taken twice"))?;

        Ok(BidiCall {
            endpoint: self.clone(),
            state,
            inbox,
            finished: false,
            released: false,
            _pd: PhantomData,
        })
    }
}

/// Handle returned by `call_server_stream`.
pub struct ServerStreamCall<Resp, C> {
    endpoint: Arc<Endpoint>,
    state: Arc<StreamState>,
    inbox: tokio::sync::mpsc::Receiver<Bytes>,
    trailer: Option<Trailer>,
    released: bool,
    _pd: PhantomData<(Resp, C)>,
}

impl<Resp, C> ServerStreamCall<Resp, C>
where
    Resp: DeserializeOwned,
    C: Codec,
{
    /// Returns the next response, or `None` once the stream has ended (check
    /// `status()` afterwards for the terminal trailer).
    pub async fn recv(&mut self) -> Option<Result<Resp, RpcError>> {
        if let Some(bytes) = self.inbox.recv().await {
            return Some(
                C::decode(&bytes).map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string())),
            );
        }
        let trailer = self.endpoint.await_trailer(&self.state).await;
        self.endpoint.release(&self.state);
        self.released = true;
        let status = trailer.status;
        let message = trailer.message.clone();
        self.trailer = Some(trailer);
        if status != StatusCode::Ok {
            return Some(Err(RpcError {
                code: status,
                message,
            }));
        }
        None
    }
}

/// Dropping the handle before a terminal trailer arrived cancels the stream (§4.7):
/// marks it cancelled locally, best-effort signals the peer, and releases the id.
impl<Resp, C> Drop for ServerStreamCall<Resp, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let already_cancelled = self.state.is_cancelled();
        self.state.cancel();
        if !already_cancelled {
            spawn_cancel_signal(&self.endpoint, self.state.id);
        }
        self.endpoint.release(&self.state);
    }
}

/// Handle returned by `open_client_stream`.
pub struct ClientStreamCall<Req, Resp, C> {
    endpoint: Arc<Endpoint>,
    state: Arc<StreamState>,
    finished: bool,
    released: bool,
    _pd: PhantomData<(Req, Resp, C)>,
}

impl<Req, Resp, C> ClientStreamCall<Req, Resp, C>
where
    Req: Serialize,
    Resp: DeserializeOwned,
    C: Codec,
{
    pub async fn send(&mut self, req: Req) -> Result<(), RpcError> {
        if self.finished {
            return Err(RpcError::status(StatusCode::FailedPrecondition));
        }
        if self.state.is_cancelled() {
            return Err(RpcError::cancelled());
        }
        self.endpoint.send_request::<Req, C>(&self.state, &req, false).await
    }

    pub async fn finish_sending(&mut self) -> Result<(), RpcError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.endpoint.finish_sending(&self.state).await
    }

    /// Await the single reply. Implicitly calls `finish_sending` if not already done.
    pub async fn response(mut self) -> Result<Resp, RpcError> {
        if !self.finished {
            self.finish_sending().await?;
        }
        let mut inbox = self
            .state
            .take_inbox()
            .await
            .ok_or_else(|| RpcError::internal("inbox taken twice"))?;
        let message = inbox.recv().await;
        let trailer = self.endpoint.await_trailer(&self.state).await;
        self.endpoint.release(&self.state);
        self.released = true;

        if trailer.status != StatusCode::Ok {
            return Err(RpcError {
                code: trailer.status,
                message: trailer.message,
            });
        }
        let bytes = message.ok_or_else(|| RpcError::internal("client-stream call completed with no response"))?;
        C::decode(&bytes).map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string()))
    }
}

impl<Req, Resp, C> Drop for ClientStreamCall<Req, Resp, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let already_cancelled = self.state.is_cancelled();
        self.state.cancel();
        if !already_cancelled {
            spawn_cancel_signal(&self.endpoint, self.state.id);
        }
        self.endpoint.release(&self.state);
    }
}

/// Handle returned by `open_bidi`.
pub struct BidiCall<Req, Resp, C> {
    endpoint: Arc<Endpoint>,
    state: Arc<StreamState>,
    inbox: tokio::sync::mpsc::Receiver<Bytes>,
    finished: bool,
    released: bool,
    _pd: PhantomData<(Req, Resp, C)>,
}

impl<Req, Resp, C> BidiCall<Req, Resp, C>
where
    Req: Serialize,
    Resp: DeserializeOwned,
    C: Codec,
{
    pub async fn send(&mut self, req: Req) -> Result<(), RpcError> {
        if self.finished {
            return Err(RpcError::status(StatusCode::FailedPrecondition));
        }
        if self.state.is_cancelled() {
            return Err(RpcError::cancelled());
        }
        self.endpoint.send_request::<Req, C>(&self.state, &req, false).await
    }

    pub async fn finish_sending(&mut self) -> Result<(), RpcError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.endpoint.finish_sending(&self.state).await
    }

    pub async fn recv(&mut self) -> Option<Result<Resp, RpcError>> {
        if let Some(bytes) = self.inbox.recv().await {
            return Some(
                C::decode(&bytes).map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string())),
            );
        }
        let trailer = self.endpoint.await_trailer(&self.state).await;
        self.endpoint.release(&self.state);
        self.released = true;
        if trailer.status != StatusCode::Ok {
            return Some(Err(RpcError {
                code: trailer.status,
                message: trailer.message,
            }));
        }
        None
    }

    /// Cancel the call (§4.6): drives the local FSM to `Closed` so any further
    /// `send` is rejected, and tells the peer via a DATA-less, end-of-stream
    /// METADATA frame so its responder stops too.
    pub async fn cancel(&self) {
        self.state.cancel();
        self.endpoint.send_cancel_signal(self.state.id).await;
    }
}

impl<Req, Resp, C> Drop for BidiCall<Req, Resp, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let already_cancelled = self.state.is_cancelled();
        self.state.cancel();
        if !already_cancelled {
            spawn_cancel_signal(&self.endpoint, self.state.id);
        }
        self.endpoint.release(&self.state);
    }
}

/// Best-effort peer cancel notification from a synchronous `Drop`: fire a detached
/// task if a runtime is available, otherwise the peer just finds out from the
/// transport closing.
fn spawn_cancel_signal(endpoint: &Arc<Endpoint>, stream_id: u32) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let endpoint = endpoint.clone();
        handle.spawn(async move {
            endpoint.send_cancel_signal(stream_id).await;
        });
    }
}
