//! C4 - Transport contract (§6.1): an abstract full-duplex, frame-preserving channel.
//!
//! Concrete transports are external collaborators; only the contract is normative.
//! Two reference implementations ship here purely so the engine can be exercised
//! end-to-end in tests: an in-memory paired channel, and a length-prefixed adapter
//! over any `AsyncRead + AsyncWrite` byte stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::TransportError;
use crate::frame::Frame;

const MEM_CHANNEL_CAPACITY: usize = 64;

/// A transport that callers and responders share to exchange frames.
///
/// Implemented as an enum over reference backends rather than a boxed trait object,
/// since frame send/recv are async and this avoids requiring a dyn-compatible async
/// trait for what is, in this crate, a two-member set.
#[derive(Clone)]
pub enum Transport {
    Mem(Arc<MemTransport>),
    Stream(Arc<StreamTransport>),
}

impl Transport {
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        match self {
            Self::Mem(t) => t.send_frame(frame).await,
            Self::Stream(t) => t.send_frame(frame).await,
        }
    }

    /// Receive the next frame, or `Ok(None)` when the transport has been cleanly closed.
    pub async fn recv_frame(&self) -> Result<Option<Frame>, TransportError> {
        match self {
            Self::Mem(t) => t.recv_frame().await,
            Self::Stream(t) => t.recv_frame().await,
        }
    }

    pub fn close(&self) {
        match self {
            Self::Mem(t) => t.close(),
            Self::Stream(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Mem(t) => t.is_closed(),
            Self::Stream(t) => t.is_closed(),
        }
    }
}

/// In-process, message-preserving transport. One frame in, one frame out; no
/// serialization takes place. Intended for unit and integration tests.
pub struct MemTransport {
    tx: mpsc::Sender<Frame>,
    rx: AsyncMutex<mpsc::Receiver<Frame>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Construct a cross-wired pair: frames sent on one end arrive on the other.
    pub fn pair() -> (Transport, Transport) {
        let (tx_a, rx_a) = mpsc::channel(MEM_CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(MEM_CHANNEL_CAPACITY);

        let a = Arc::new(MemTransport {
            tx: tx_b,
            rx: AsyncMutex::new(rx_a),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(MemTransport {
            tx: tx_a,
            rx: AsyncMutex::new(rx_b),
            closed: AtomicBool::new(false),
        });

        (Transport::Mem(a), Transport::Mem(b))
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    pub async fn recv_frame(&self) -> Result<Option<Frame>, TransportError> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Length-prefixed adapter over any byte-stream carrier (TCP, `tokio::io::duplex`, ...).
/// Each frame is written as `[len: u32 BE][encoded frame bytes]`.
pub struct StreamTransport {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<BoxedWriter>,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            reader: AsyncMutex::new(Box::pin(reader)),
            writer: AsyncMutex::new(Box::pin(writer)),
            closed: AtomicBool::new(false),
        })
    }

    /// Convenience constructor for tests: an in-process duplex pair.
    pub fn pair(buf_size: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(buf_size);
        (
            Transport::Stream(Self::new(a)),
            Transport::Stream(Self::new(b)),
        )
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut body = BytesMut::new();
        frame
            .encode(&mut body)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn recv_frame(&self) -> Result<Option<Frame>, TransportError> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        let len = match reader.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        let frame = Frame::decode(Bytes::from(buf)).map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Some(frame))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_transport_delivers_frames_in_order() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Frame::data(1, Bytes::from_static(b"one"), false))
            .await
            .unwrap();
        a.send_frame(Frame::data(1, Bytes::from_static(b"two"), true))
            .await
            .unwrap();

        let f1 = b.recv_frame().await.unwrap().unwrap();
        let f2 = b.recv_frame().await.unwrap().unwrap();
        assert_eq!(f1.body, Bytes::from_static(b"one"));
        assert_eq!(f2.body, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn stream_transport_round_trips_frames() {
        let (a, b) = StreamTransport::pair(4096);
        let frame = Frame::metadata(5, Some("/Echo/Ping".into()), Bytes::new(), false);
        a.send_frame(frame.clone()).await.unwrap();
        let got = b.recv_frame().await.unwrap().unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn closed_transport_recv_returns_none() {
        let (a, _b) = MemTransport::pair();
        a.close();
        assert!(a.recv_frame().await.unwrap().is_none());
    }
}
