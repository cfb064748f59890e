//! Client side of a relay session, independent of the socket implementation.
//!
//! - Inbound: the socket pushes frames into a bounded [`ClientFeed`]; the session
//!   reads them from the paired [`ClientInbound`] in arrival order.
//! - Outbound: the session writes through a [`ClientHandle`], which wraps the
//!   socket's [`ClientSink`] and enforces close-once.

use crate::relay::event::TranscriptEvent;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One message received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
}

/// Result of waiting for the next inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Frame(ClientFrame),
    /// Socket closed or failed; no more frames will arrive
    Disconnected,
    /// The client outran the session and the feed was cut
    Overloaded,
}

/// Error returned by a feed that no longer accepts frames.
#[derive(Debug, PartialEq, Eq)]
pub enum FeedError {
    /// This push overflowed the feed; the session will be failed
    Overloaded,
    /// Session side is gone or the feed was already cut
    Closed,
}

/// Socket-side producer of inbound frames.
pub struct ClientFeed {
    tx: Option<mpsc::Sender<ClientFrame>>,
    overloaded: Arc<AtomicBool>,
}

/// Session-side consumer of inbound frames.
pub struct ClientInbound {
    rx: mpsc::Receiver<ClientFrame>,
    overloaded: Arc<AtomicBool>,
}

/// Create a connected feed/inbound pair holding at most `capacity` frames.
pub fn client_channel(capacity: usize) -> (ClientFeed, ClientInbound) {
    let (tx, rx) = mpsc::channel(capacity);
    let overloaded = Arc::new(AtomicBool::new(false));
    (
        ClientFeed { tx: Some(tx), overloaded: overloaded.clone() },
        ClientInbound { rx, overloaded },
    )
}

impl ClientFeed {
    /// Queue a frame without waiting. A full queue cuts the feed rather than
    /// dropping the frame, so the session never forwards a gapped stream.
    pub fn push(&mut self, frame: ClientFrame) -> Result<(), FeedError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(FeedError::Closed);
        };

        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overloaded.store(true, Ordering::SeqCst);
                self.tx = None;
                Err(FeedError::Overloaded)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.tx = None;
                Err(FeedError::Closed)
            }
        }
    }

    /// Signal that the socket is gone.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

impl ClientInbound {
    pub async fn recv(&mut self) -> Inbound {
        match self.rx.recv().await {
            Some(frame) => Inbound::Frame(frame),
            None if self.overloaded.load(Ordering::SeqCst) => Inbound::Overloaded,
            None => Inbound::Disconnected,
        }
    }

    /// Stop accepting frames; anything still buffered is discarded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// The socket could not take the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

/// How the socket should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientClose {
    /// Orderly end of stream (1000)
    Normal,
    /// Session failed (1011)
    Error,
    /// Server going away (1001)
    Shutdown,
}

/// Outbound half of a client socket.
#[async_trait]
pub trait ClientSink: Send {
    /// Deliver one event. Resolves once the socket has accepted it.
    async fn send(&mut self, event: &TranscriptEvent) -> Result<(), ClientGone>;

    fn close(&mut self, how: ClientClose);
}

/// Close-once wrapper around a [`ClientSink`].
///
/// After the first failed write the socket is treated as gone: later events are
/// discarded without another write attempt.
pub struct ClientHandle {
    sink: Box<dyn ClientSink>,
    gone: bool,
    closed: bool,
}

impl ClientHandle {
    pub fn new(sink: Box<dyn ClientSink>) -> Self {
        Self { sink, gone: false, closed: false }
    }

    pub async fn send(&mut self, event: &TranscriptEvent) -> Result<(), ClientGone> {
        if self.gone || self.closed {
            return Err(ClientGone);
        }

        let result = self.sink.send(event).await;
        if result.is_err() {
            debug!(kind = event.kind(), "client socket gone, discarding event");
            self.gone = true;
        }
        result
    }

    /// Mark the socket as disconnected by the peer.
    pub fn mark_gone(&mut self) {
        self.gone = true;
    }

    #[cfg(test)]
    pub fn is_gone(&self) -> bool {
        self.gone
    }

    /// Close the socket. Returns `false` if it was already closed.
    pub fn close(&mut self, how: ClientClose) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.sink.close(how);
        true
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.close(ClientClose::Error);
    }
}
