//! # Upstream Session Handle
//!
//! One connection to the remote recognition service, split into two halves so
//! the directions never wait on each other:
//! - the **sink** half accepts audio frames (`send`) and a final `close`,
//! - the **results** half is a lazy, finite stream of [`TranscriptEvent`]s that
//!   ends when the upstream closes or fails. It can be taken exactly once.
//!
//! Vendors plug in through [`UpstreamConnector`]; [`UpstreamHandle`] layers the
//! lifecycle rules on top (reject after close, close once, bounded close).

use crate::relay::error::UpstreamError;
use crate::relay::event::TranscriptEvent;
use crate::relay::format::{AudioFormat, RecognitionOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered upstream results. The stream ends after the upstream closes.
pub type EventStream = BoxStream<'static, TranscriptEvent>;

/// Opens recognition connections. Shared by every session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(
        &self,
        format: &AudioFormat,
        options: &RecognitionOptions,
    ) -> Result<UpstreamConnection, UpstreamError>;
}

/// Sending half of one upstream connection.
#[async_trait]
pub trait UpstreamSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), UpstreamError>;

    /// Tell the upstream no more audio is coming so it can flush and close.
    /// The results stream keeps delivering trailing events afterwards.
    async fn close(&mut self);
}

/// What a connector hands back: both halves of a fresh connection.
pub struct UpstreamConnection {
    pub sink: Box<dyn UpstreamSink>,
    pub results: EventStream,
}

/// Lifecycle wrapper around an [`UpstreamConnection`].
///
/// ## Guarantees:
/// - `send` after `close` fails with `UpstreamClosed`; frames are never queued
/// - the vendor `close` runs at most once, bounded by `close_timeout`
/// - dropping an unclosed handle still closes the vendor connection in the background
pub struct UpstreamHandle {
    sink: Option<Box<dyn UpstreamSink>>,
    results: Option<EventStream>,
    closing: bool,
    close_timeout: Duration,
}

impl UpstreamHandle {
    pub fn new(connection: UpstreamConnection, close_timeout: Duration) -> Self {
        Self {
            sink: Some(connection.sink),
            results: Some(connection.results),
            closing: false,
            close_timeout,
        }
    }

    /// Forward one audio frame.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), UpstreamError> {
        if self.closing {
            return Err(UpstreamError::UpstreamClosed);
        }

        match self.sink.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(UpstreamError::UpstreamClosed),
        }
    }

    /// Take the result stream. Returns `None` on every call after the first.
    pub fn results(&mut self) -> Option<EventStream> {
        self.results.take()
    }

    /// Close the sending half. Returns `false` if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;

        if let Some(sink) = self.sink.as_mut() {
            if tokio::time::timeout(self.close_timeout, sink.close()).await.is_err() {
                warn!(
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "upstream close timed out"
                );
            }
        }
        // Dropping the sink releases the write half of the connection.
        self.sink = None;
        debug!("upstream sink closed");
        true
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closing
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        if self.closing {
            return;
        }
        let Some(mut sink) = self.sink.take() else {
            return;
        };

        // Reached only when the owning task unwound without running teardown.
        let timeout = self.close_timeout;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = tokio::time::timeout(timeout, sink.close()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::ScriptedUpstream;
    use futures_util::StreamExt;

    fn open_handle(upstream: &ScriptedUpstream) -> UpstreamHandle {
        UpstreamHandle::new(upstream.connection(), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let upstream = ScriptedUpstream::new();
        let mut handle = open_handle(&upstream);

        handle.send(Bytes::from_static(b"one")).await.unwrap();
        assert!(handle.close().await);

        let err = handle.send(Bytes::from_static(b"two")).await.unwrap_err();
        assert_eq!(err, UpstreamError::UpstreamClosed);
        assert_eq!(upstream.sent_frames(), vec![Bytes::from_static(b"one")]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let upstream = ScriptedUpstream::new();
        let mut handle = open_handle(&upstream);

        assert!(!handle.is_closed());
        assert!(handle.close().await);
        assert!(handle.is_closed());
        assert!(!handle.close().await);
        assert_eq!(upstream.close_count(), 1);
    }

    #[tokio::test]
    async fn test_results_are_not_restartable() {
        let upstream = ScriptedUpstream::new();
        upstream.emit(TranscriptEvent::interim("hi"));
        upstream.finish();
        let mut handle = open_handle(&upstream);

        let mut results = handle.results().expect("first take");
        assert!(handle.results().is_none());

        assert_eq!(results.next().await, Some(TranscriptEvent::interim("hi")));
        assert_eq!(results.next().await, None);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_closes_upstream() {
        let upstream = ScriptedUpstream::new();
        let handle = open_handle(&upstream);
        drop(handle);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(upstream.close_count(), 1);
    }
}
