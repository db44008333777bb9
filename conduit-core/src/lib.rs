//! Transport-agnostic multiplexed RPC engine: the stream-multiplexing and
//! call-lifecycle core shared by every concrete transport and codec.
//!
//! Components, per the design documentation: frame codec, stream-id manager,
//! message parser, transport contract, stream registry, call state machine,
//! caller runtime, responder runtime, method registry, and the endpoint facade
//! that wires them together.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod fault;
pub mod fsm;
pub mod frame;
pub mod headers;
pub mod parser;
pub mod registry;
pub mod stream;
pub mod stream_id;
pub mod transport;

pub mod prelude {
    pub use crate::codec::{Codec, JsonCodec, PostcardCodec};
    pub use crate::endpoint::{BidiCall, ClientStreamCall, Endpoint, EndpointConfig, Role, ServerStreamCall};
    pub use crate::error::{RpcError, StatusCode};
    pub use crate::fault::{FaultAction, FaultInjector};
    pub use crate::registry::{DecodedStream, EncodingSender, HandlerContext, ServiceBuilder, ServiceContract};
    pub use crate::transport::{MemTransport, StreamTransport, Transport};
}
