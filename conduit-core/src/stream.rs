//! Per-stream runtime state shared between the endpoint's read loop and whichever
//! call-shape handle (caller or responder side) owns the stream. Backs C5 and C6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};

use crate::error::{ParserError, StatusCode};
use crate::fsm::{self, Event, Phase};
use crate::parser::MessageParser;

pub const DEFAULT_INBOX_CAPACITY: usize = 32;

/// The trailer a responder sends to terminate a stream (§3).
#[derive(Debug, Clone)]
pub struct Trailer {
    pub status: StatusCode,
    pub message: Option<String>,
}

/// Shared state for one local half of one stream.
pub struct StreamState {
    pub id: u32,
    capacity: usize,
    phase: SyncMutex<Phase>,
    inbox_tx: SyncMutex<Option<mpsc::Sender<Bytes>>>,
    inbox_rx: AsyncMutex<Option<mpsc::Receiver<Bytes>>>,
    trailer_tx: SyncMutex<Option<oneshot::Sender<Trailer>>>,
    trailer_rx: AsyncMutex<Option<oneshot::Receiver<Trailer>>>,
    parser: SyncMutex<MessageParser>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl StreamState {
    pub fn new(id: u32, inbox_capacity: usize, max_message_size: usize) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity);
        let (trailer_tx, trailer_rx) = oneshot::channel();
        Arc::new(Self {
            id,
            capacity: inbox_capacity,
            phase: SyncMutex::new(Phase::Idle),
            inbox_tx: SyncMutex::new(Some(inbox_tx)),
            inbox_rx: AsyncMutex::new(Some(inbox_rx)),
            trailer_tx: SyncMutex::new(Some(trailer_tx)),
            trailer_rx: AsyncMutex::new(Some(trailer_rx)),
            parser: SyncMutex::new(MessageParser::new(max_message_size)),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        })
    }

    /// Feed freshly-arrived DATA-frame body bytes through this stream's message
    /// parser and enqueue every whole payload that falls out.
    pub async fn ingest(&self, bytes: &[u8]) -> Result<(), ParserError> {
        let payloads = self.parser.lock().push(bytes)?;
        for payload in payloads {
            self.push_message(payload.message).await;
        }
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Apply an FSM event, updating the shared phase. Returns the illegal-transition
    /// error without mutating state further; callers force-close on error.
    pub fn apply(&self, event: Event) -> Result<Phase, fsm::FsmError> {
        let mut phase = self.phase.lock();
        let next = fsm::transition(*phase, event)?;
        *phase = next;
        Ok(next)
    }

    /// Push a decoded message into this stream's inbox. A no-op once the inbox has
    /// been closed (stream cancelled, or trailer already delivered).
    pub async fn push_message(&self, bytes: Bytes) {
        let tx = self.inbox_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(bytes).await;
        }
    }

    /// Take ownership of the inbox receiver. May only be called once per stream;
    /// subsequent calls return `None`.
    pub async fn take_inbox(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbox_rx.lock().await.take()
    }

    /// Close the inbox so a pending `recv()` on it resolves to `None`. Called once
    /// a trailer has been delivered: no further messages can legally follow.
    pub fn close_inbox(&self) {
        self.inbox_tx.lock().take();
    }

    pub fn resolve_trailer(&self, trailer: Trailer) {
        if let Some(tx) = self.trailer_tx.lock().take() {
            let _ = tx.send(trailer);
        }
        self.close_inbox();
    }

    pub async fn take_trailer_receiver(&self) -> Option<oneshot::Receiver<Trailer>> {
        self.trailer_rx.lock().await.take()
    }

    /// Mark this stream cancelled: drives the FSM to `Closed` (§4.6's CANCEL event,
    /// legal from any phase), wakes anything waiting on `cancelled_fut`, and closes
    /// the inbox so a pending `recv` resolves to `None` instead of blocking forever.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.apply(Event::Cancel);
        self.cancel_notify.notify_waiters();
        self.close_inbox();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Count of decoded messages currently sitting in the inbox, awaiting a `recv`.
    /// Used for the endpoint-wide high-water mark (§5); derived from the channel's
    /// remaining permit count rather than a separate counter.
    pub fn buffered_len(&self) -> usize {
        match self.inbox_tx.lock().as_ref() {
            Some(tx) => self.capacity.saturating_sub(tx.capacity()),
            None => 0,
        }
    }

    pub async fn cancelled_fut(&self) {
        if self.is_cancelled() {
            return;
        }
        self.cancel_notify.notified().await;
    }
}

/// C5 - Stream registry: per-endpoint `stream_id -> StreamState` lookup used to route
/// inbound frames. Holds lookup references only; it does not extend stream lifetime.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<SyncMutex<HashMap<u32, Arc<StreamState>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    pub fn insert(&self, state: Arc<StreamState>) {
        self.inner.lock().insert(state.id, state);
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<StreamState>> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<StreamState>> {
        self.inner.lock().remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<StreamState>> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
