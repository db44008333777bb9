//! C9 - Method registry: `(service, method) -> descriptor` populated by service
//! contracts at setup time, consulted by the responder dispatcher (C8).

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec::Codec;
use crate::error::{RegistryError, RpcError, StatusCode};
use crate::frame::Frame;
use crate::fsm::Event;
use crate::parser::encode_payload;
use crate::stream::StreamState;
use crate::transport::Transport;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStream,
    ClientStream,
    Bidi,
}

/// Everything a handler needs besides the decoded request(s): the path it was
/// invoked on, an optional deadline, and cooperative cancellation.
#[derive(Clone)]
pub struct HandlerContext {
    pub method_path: String,
    pub deadline: Option<Instant>,
    pub(crate) stream: Arc<StreamState>,
}

impl HandlerContext {
    pub fn is_cancelled(&self) -> bool {
        self.stream.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.stream.cancelled_fut().await
    }
}

/// Decode-on-read view over a stream's inbox, handed to client-stream and bidi handlers.
pub struct DecodedStream<Req, C: Codec> {
    rx: mpsc::Receiver<Bytes>,
    _pd: PhantomData<(Req, C)>,
}

impl<Req, C> DecodedStream<Req, C>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    C: Codec,
{
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            _pd: PhantomData,
        }
    }

    pub async fn recv(&mut self) -> Option<Result<Req, RpcError>> {
        let bytes = self.rx.recv().await?;
        Some(
            C::decode(&bytes)
                .map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string())),
        )
    }
}

/// Encode-on-write view over the wire, handed to server-stream and bidi handlers.
/// Each `send` emits one DATA frame directly on the owning stream.
pub struct EncodingSender<Resp, C: Codec> {
    transport: Transport,
    stream: Arc<StreamState>,
    _pd: PhantomData<(Resp, C)>,
}

impl<Resp, C> EncodingSender<Resp, C>
where
    Resp: Serialize + Send + Sync + 'static,
    C: Codec,
{
    pub(crate) fn new(transport: Transport, stream: Arc<StreamState>) -> Self {
        Self {
            transport,
            stream,
            _pd: PhantomData,
        }
    }

    pub async fn send(&self, value: &Resp) -> Result<(), RpcError> {
        if self.stream.is_cancelled() {
            return Err(RpcError::cancelled());
        }
        let bytes = C::encode(value).map_err(|e| RpcError::internal(e.to_string()))?;
        let payload = encode_payload(0, &bytes);
        self.stream
            .apply(Event::SendData)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        let frame = Frame::data(self.stream.id, payload, false);
        self.transport.send_frame(frame).await?;
        Ok(())
    }
}

/// Type-erased handler invoked by the responder dispatcher (C8). Operates directly
/// on the owning stream and transport so every call shape emits DATA frames the
/// same way, regardless of whether it came from a typed sender or a single reply.
pub trait ErasedHandler: Send + Sync {
    fn invoke(
        self: Arc<Self>,
        transport: Transport,
        stream: Arc<StreamState>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, Result<(), RpcError>>;
}

async fn recv_one(stream: &Arc<StreamState>) -> Result<Bytes, RpcError> {
    let mut inbox = stream
        .take_inbox()
        .await
        .ok_or_else(|| RpcError::internal("inbox already consumed"))?;
    inbox
        .recv()
        .await
        .ok_or_else(|| RpcError::internal("stream closed before a request arrived"))
}

async fn send_one<Resp, C>(
    transport: &Transport,
    stream: &Arc<StreamState>,
    value: &Resp,
) -> Result<(), RpcError>
where
    Resp: Serialize,
    C: Codec,
{
    let bytes = C::encode(value).map_err(|e| RpcError::internal(e.to_string()))?;
    let payload = encode_payload(0, &bytes);
    stream
        .apply(Event::SendData)
        .map_err(|e| RpcError::internal(e.to_string()))?;
    let frame = Frame::data(stream.id, payload, false);
    transport.send_frame(frame).await?;
    Ok(())
}

struct UnaryHandler<F, Req, Resp, C> {
    f: F,
    _pd: PhantomData<fn() -> (Req, Resp, C)>,
}

impl<F, Req, Resp, C, Fut> ErasedHandler for UnaryHandler<F, Req, Resp, C>
where
    F: Fn(Req, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
    C: Codec,
{
    fn invoke(
        self: Arc<Self>,
        transport: Transport,
        stream: Arc<StreamState>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async move {
            let bytes = recv_one(&stream).await?;
            let req: Req = C::decode(&bytes)
                .map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string()))?;
            let resp = (self.f)(req, ctx).await?;
            send_one::<Resp, C>(&transport, &stream, &resp).await
        })
    }
}

struct ServerStreamHandler<F, Req, Resp, C> {
    f: F,
    _pd: PhantomData<fn() -> (Req, Resp, C)>,
}

impl<F, Req, Resp, C, Fut> ErasedHandler for ServerStreamHandler<F, Req, Resp, C>
where
    F: Fn(Req, HandlerContext, EncodingSender<Resp, C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
    C: Codec,
{
    fn invoke(
        self: Arc<Self>,
        transport: Transport,
        stream: Arc<StreamState>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async move {
            let bytes = recv_one(&stream).await?;
            let req: Req = C::decode(&bytes)
                .map_err(|e| RpcError::new(StatusCode::InvalidArgument, e.to_string()))?;
            let sender = EncodingSender::new(transport, stream);
            (self.f)(req, ctx, sender).await
        })
    }
}

struct ClientStreamHandler<F, Req, Resp, C> {
    f: F,
    _pd: PhantomData<fn() -> (Req, Resp, C)>,
}

impl<F, Req, Resp, C, Fut> ErasedHandler for ClientStreamHandler<F, Req, Resp, C>
where
    F: Fn(DecodedStream<Req, C>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
    C: Codec,
{
    fn invoke(
        self: Arc<Self>,
        transport: Transport,
        stream: Arc<StreamState>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async move {
            let inbox = stream
                .take_inbox()
                .await
                .ok_or_else(|| RpcError::internal("inbox already consumed"))?;
            let decoded = DecodedStream::new(inbox);
            let resp = (self.f)(decoded, ctx).await?;
            send_one::<Resp, C>(&transport, &stream, &resp).await
        })
    }
}

struct BidiHandler<F, Req, Resp, C> {
    f: F,
    _pd: PhantomData<fn() -> (Req, Resp, C)>,
}

impl<F, Req, Resp, C, Fut> ErasedHandler for BidiHandler<F, Req, Resp, C>
where
    F: Fn(DecodedStream<Req, C>, HandlerContext, EncodingSender<Resp, C>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
    C: Codec,
{
    fn invoke(
        self: Arc<Self>,
        transport: Transport,
        stream: Arc<StreamState>,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async move {
            let inbox = stream
                .take_inbox()
                .await
                .ok_or_else(|| RpcError::internal("inbox already consumed"))?;
            let decoded = DecodedStream::new(inbox);
            let sender = EncodingSender::new(transport, stream);
            (self.f)(decoded, ctx, sender).await
        })
    }
}

pub struct MethodDescriptor {
    pub service: String,
    pub method: String,
    pub kind: MethodKind,
    pub handler: Arc<dyn ErasedHandler>,
}

/// Builder a `ServiceContract` populates during `setup()`.
#[derive(Default)]
pub struct ServiceBuilder {
    service: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: Vec::new(),
        }
    }

    pub fn add_unary_method<F, Req, Resp, C, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Req, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        C: Codec,
    {
        self.methods.push(MethodDescriptor {
            service: self.service.clone(),
            method: method.into(),
            kind: MethodKind::Unary,
            handler: Arc::new(UnaryHandler::<F, Req, Resp, C> {
                f: handler,
                _pd: PhantomData,
            }),
        });
    }

    pub fn add_server_stream_method<F, Req, Resp, C, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) where
        F: Fn(Req, HandlerContext, EncodingSender<Resp, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        C: Codec,
    {
        self.methods.push(MethodDescriptor {
            service: self.service.clone(),
            method: method.into(),
            kind: MethodKind::ServerStream,
            handler: Arc::new(ServerStreamHandler::<F, Req, Resp, C> {
                f: handler,
                _pd: PhantomData,
            }),
        });
    }

    pub fn add_client_stream_method<F, Req, Resp, C, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) where
        F: Fn(DecodedStream<Req, C>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        C: Codec,
    {
        self.methods.push(MethodDescriptor {
            service: self.service.clone(),
            method: method.into(),
            kind: MethodKind::ClientStream,
            handler: Arc::new(ClientStreamHandler::<F, Req, Resp, C> {
                f: handler,
                _pd: PhantomData,
            }),
        });
    }

    pub fn add_bidi_method<F, Req, Resp, C, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(DecodedStream<Req, C>, HandlerContext, EncodingSender<Resp, C>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        C: Codec,
    {
        self.methods.push(MethodDescriptor {
            service: self.service.clone(),
            method: method.into(),
            kind: MethodKind::Bidi,
            handler: Arc::new(BidiHandler::<F, Req, Resp, C> {
                f: handler,
                _pd: PhantomData,
            }),
        });
    }
}

/// Implemented by user-defined services; `setup` registers each method once.
pub trait ServiceContract {
    fn setup(&self, builder: &mut ServiceBuilder);
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<(String, String), MethodDescriptor>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    pub fn register_service<S: ServiceContract>(
        &mut self,
        service: impl Into<String>,
        contract: &S,
    ) -> Result<(), RegistryError> {
        let mut builder = ServiceBuilder::new(service.into());
        contract.setup(&mut builder);
        for descriptor in builder.methods {
            let key = (descriptor.service.clone(), descriptor.method.clone());
            if self.methods.contains_key(&key) {
                return Err(RegistryError::AlreadyExists {
                    service: key.0,
                    method: key.1,
                });
            }
            self.methods.insert(key, descriptor);
        }
        Ok(())
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(&(service.to_string(), method.to_string()))
    }
}

/// Split `/Service/Method` into its two components.
pub fn parse_method_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    rest.split_once('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ServiceContract for Echo {
        fn setup(&self, b: &mut ServiceBuilder) {
            b.add_unary_method::<_, String, String, crate::codec::JsonCodec, _>(
                "Ping",
                |req: String, _ctx| async move { Ok(req) },
            );
        }
    }

    #[test]
    fn registers_and_looks_up_methods() {
        let mut registry = MethodRegistry::new();
        registry.register_service("Echo", &Echo).unwrap();
        assert!(registry.lookup("Echo", "Ping").is_some());
        assert!(registry.lookup("Echo", "Nope").is_none());
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut registry = MethodRegistry::new();
        registry.register_service("Echo", &Echo).unwrap();
        let err = registry.register_service("Echo", &Echo).unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyExists {
                service: "Echo".into(),
                method: "Ping".into(),
            }
        );
    }

    #[test]
    fn parses_method_path() {
        assert_eq!(parse_method_path("/Echo/Ping"), Some(("Echo", "Ping")));
        assert_eq!(parse_method_path("no-slash"), None);
    }
}
