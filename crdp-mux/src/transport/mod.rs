//! Connection adapters for the physical link to the debug target.
//!
//! The multiplexor only needs two things from a connection: a non-blocking way to
//! queue an outbound message ([`Connection`]) and a stream of inbound
//! [`ConnectionEvent`]s. Adapters spawn a writer task that drains the queue, so
//! writes from different channels never interleave.

pub mod pipe;
pub mod websocket;

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

/// Outbound half of the physical connection.
///
/// This abstraction lets the multiplexor be driven in tests without a real target.
pub trait Connection: Send + Sync {
    /// Queue one message for transmission.
    ///
    /// Must not block, and must not call back into the multiplexor: `Channel::send`
    /// holds the channel lock across this call, so an implementation that routes a
    /// reply synchronously into `Multiplexor::on_message` deadlocks. In-process targets
    /// queue the message and answer from another task, as [`QueuedConnection`] does.
    fn send(&self, text: String) -> Result<(), TransportError>;
}

impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn send(&self, text: String) -> Result<(), TransportError> {
        (**self).send(text)
    }
}

/// Everything the connection reports inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Message(String),
    Close { reason: Option<String> },
    Error(String),
}

impl ConnectionEvent {
    /// Kind for non-multiplexed events; `None` for messages, which are routed per channel.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Open => Some(EventKind::Open),
            Self::Message(_) => None,
            Self::Close { .. } => Some(EventKind::Close),
            Self::Error(_) => Some(EventKind::Error),
        }
    }
}

/// Connection-level events broadcast unchanged to every interested listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Close,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("i/o error: {0}")]
    Io(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = ConnectionEvent> + Send>>;

/// Connection handle backed by an unbounded queue.
///
/// The receiving end belongs to whichever task owns the actual socket.
#[derive(Debug, Clone)]
pub struct QueuedConnection {
    tx: mpsc::UnboundedSender<String>,
}

impl QueuedConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Connection for QueuedConnection {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}
