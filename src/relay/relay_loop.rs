//! # Bidirectional Relay Loop
//!
//! Moves data in both directions for one streaming session:
//!
//! ```text
//!  client ──frames──► pump_inbound ──send()──► upstream
//!  client ◄──events── pump_outbound ◄── OutboundQueue ◄── reader task ◄── upstream results
//! ```
//!
//! - The reader task is spawned per session and aborted when the loop returns,
//!   so no background work outlives the session.
//! - The two pumps run concurrently in one `select!` together with the idle
//!   watchdog and the shutdown token. Whichever finishes first decides how the
//!   other side is wound down.
//!
//! ## Half-close propagation:
//! - client stop or disconnect: close the upstream, then keep delivering
//!   trailing results for at most the grace period
//! - upstream close or error: stop reading from the client immediately
//! - idle timeout, shutdown, send failure: flush what is already queued, then stop
//!
//! The loop never sends the terminal `close`/`error` message itself; it returns a
//! [`SessionEnd`] and teardown sends exactly one.

use crate::relay::client::{ClientFrame, ClientHandle, ClientInbound, Inbound};
use crate::relay::error::{RelayError, UpstreamError};
use crate::relay::event::{
    ClientControl, TranscriptEvent, CLOSE_CLIENT_STOP, CLOSE_SERVER_SHUTDOWN, CLOSE_UPSTREAM,
};
use crate::relay::queue::OutboundQueue;
use crate::relay::teardown::SessionEnd;
use crate::relay::upstream::{EventStream, UpstreamHandle};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for one relay loop.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub outbound_capacity: usize,
    pub send_retry_attempts: u32,
    pub send_retry_backoff: Duration,
}

/// What happened over the life of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub end: SessionEnd,
    pub frames_forwarded: u64,
    pub events_delivered: u64,
    pub dropped_interim: u64,
}

/// Last time anything moved, plus traffic counters.
struct Activity {
    last: Mutex<Instant>,
    frames: AtomicU64,
    events: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            frames: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Aborts the wrapped task when dropped.
struct Supervised(JoinHandle<()>);

impl Drop for Supervised {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum InboundEnd {
    Stop,
    Disconnected,
    UpstreamClosed,
    Failed(RelayError),
}

enum OutboundEnd {
    UpstreamClosed,
    UpstreamFailed(RelayError),
    /// Queue sealed locally and drained
    Drained,
}

enum FirstEnd {
    Inbound(InboundEnd),
    Outbound(OutboundEnd),
    Idle,
    Shutdown,
}

/// Relay until either side ends. `upstream` must still hold its result stream.
pub async fn relay(
    upstream: &mut UpstreamHandle,
    client: &mut ClientHandle,
    inbound: &mut ClientInbound,
    settings: &RelaySettings,
    shutdown: &CancellationToken,
) -> RelayReport {
    let activity = Arc::new(Activity::new());
    let queue = Arc::new(OutboundQueue::new(settings.outbound_capacity));

    let Some(results) = upstream.results() else {
        return RelayReport {
            end: SessionEnd::Failed(RelayError::UpstreamStreamError(
                "result stream already consumed".to_string(),
            )),
            frames_forwarded: 0,
            events_delivered: 0,
            dropped_interim: 0,
        };
    };
    let reader = Supervised(tokio::spawn(read_results(results, queue.clone(), activity.clone())));

    let mut inbound_pump = Box::pin(pump_inbound(inbound, upstream, &activity, settings));
    let mut outbound_pump = Box::pin(pump_outbound(&queue, client, &activity));

    let first = tokio::select! {
        end = &mut inbound_pump => FirstEnd::Inbound(end),
        end = &mut outbound_pump => FirstEnd::Outbound(end),
        _ = idle_elapsed(&activity, settings.idle_timeout) => FirstEnd::Idle,
        _ = shutdown.cancelled() => FirstEnd::Shutdown,
    };
    // No more reads from the client past this point.
    drop(inbound_pump);

    let grace = settings.grace_period;
    let end = match first {
        FirstEnd::Outbound(OutboundEnd::UpstreamFailed(err)) => SessionEnd::Failed(err),
        FirstEnd::Outbound(_) => SessionEnd::Completed(CLOSE_UPSTREAM),

        FirstEnd::Inbound(InboundEnd::Stop) => {
            info!("client requested stop, flushing trailing results");
            let (_, flushed) =
                tokio::join!(upstream.close(), tokio::time::timeout(grace, &mut outbound_pump));
            match flushed {
                Ok(OutboundEnd::UpstreamFailed(err)) => SessionEnd::Failed(err),
                Ok(_) => SessionEnd::Completed(CLOSE_CLIENT_STOP),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "upstream did not finish within grace period");
                    SessionEnd::Completed(CLOSE_CLIENT_STOP)
                }
            }
        }

        FirstEnd::Inbound(InboundEnd::Disconnected) => {
            info!("client disconnected, draining upstream");
            let (_, flushed) =
                tokio::join!(upstream.close(), tokio::time::timeout(grace, &mut outbound_pump));
            if flushed.is_err() {
                debug!("grace period elapsed before upstream finished");
            }
            SessionEnd::Failed(RelayError::ClientDisconnected)
        }

        FirstEnd::Inbound(InboundEnd::UpstreamClosed) => {
            match tokio::time::timeout(grace, &mut outbound_pump).await {
                Ok(OutboundEnd::UpstreamClosed) => SessionEnd::Completed(CLOSE_UPSTREAM),
                Ok(OutboundEnd::UpstreamFailed(err)) => SessionEnd::Failed(err),
                Ok(OutboundEnd::Drained) | Err(_) => SessionEnd::Failed(
                    RelayError::UpstreamStreamError("upstream stopped accepting audio".to_string()),
                ),
            }
        }

        FirstEnd::Inbound(InboundEnd::Failed(err)) => {
            flush_queued(&reader, &queue, &mut outbound_pump, grace).await;
            SessionEnd::Failed(err)
        }

        FirstEnd::Idle => {
            warn!(idle_ms = settings.idle_timeout.as_millis() as u64, "session idle, closing");
            flush_queued(&reader, &queue, &mut outbound_pump, grace).await;
            SessionEnd::Failed(RelayError::IdleTimeout)
        }

        FirstEnd::Shutdown => {
            info!("server shutdown, closing session");
            flush_queued(&reader, &queue, &mut outbound_pump, grace).await;
            SessionEnd::Completed(CLOSE_SERVER_SHUTDOWN)
        }
    };
    drop(outbound_pump);
    drop(reader);

    let report = RelayReport {
        end,
        frames_forwarded: activity.frames.load(Ordering::Relaxed),
        events_delivered: activity.events.load(Ordering::Relaxed),
        dropped_interim: queue.dropped_interim(),
    };
    debug!(
        frames = report.frames_forwarded,
        events = report.events_delivered,
        dropped_interim = report.dropped_interim,
        "relay loop finished"
    );
    report
}

/// Stop the reader and deliver whatever it already queued.
async fn flush_queued<F>(reader: &Supervised, queue: &OutboundQueue, outbound: &mut F, grace: Duration)
where
    F: std::future::Future<Output = OutboundEnd> + Unpin,
{
    reader.0.abort();
    queue.seal();
    if tokio::time::timeout(grace, outbound).await.is_err() {
        debug!("grace period elapsed while flushing queued results");
    }
}

/// Upstream results → queue. Ends after the first terminal event.
async fn read_results(mut results: EventStream, queue: Arc<OutboundQueue>, activity: Arc<Activity>) {
    while let Some(event) = results.next().await {
        activity.touch();
        let terminal = event.is_terminal();
        if !queue.push(event) {
            debug!("interim result shed under backpressure");
        }
        if terminal {
            return;
        }
    }
    // Stream ended without saying why: treat it as an orderly close.
    queue.push(TranscriptEvent::close(CLOSE_UPSTREAM));
}

/// Queue → client, in order. Terminal events end the pump without being written.
async fn pump_outbound(queue: &OutboundQueue, client: &mut ClientHandle, activity: &Activity) -> OutboundEnd {
    while let Some(event) = queue.pop().await {
        match event {
            TranscriptEvent::Close { reason, .. } => {
                debug!(%reason, "upstream closed the stream");
                return OutboundEnd::UpstreamClosed;
            }
            TranscriptEvent::Error { message, .. } => {
                return OutboundEnd::UpstreamFailed(RelayError::UpstreamStreamError(message));
            }
            event => match client.send(&event).await {
                Ok(()) => {
                    activity.events.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => debug!(kind = event.kind(), "client gone, discarding result"),
            },
        }
    }
    OutboundEnd::Drained
}

/// Client → upstream, one frame at a time in arrival order.
async fn pump_inbound(
    inbound: &mut ClientInbound,
    upstream: &mut UpstreamHandle,
    activity: &Activity,
    settings: &RelaySettings,
) -> InboundEnd {
    loop {
        match inbound.recv().await {
            Inbound::Frame(ClientFrame::Binary(frame)) => {
                activity.touch();
                match send_with_retry(upstream, frame, settings).await {
                    Ok(()) => {
                        activity.frames.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(UpstreamError::UpstreamClosed) => return InboundEnd::UpstreamClosed,
                    Err(err) => return InboundEnd::Failed(err.into()),
                }
            }
            Inbound::Frame(ClientFrame::Text(text)) => match ClientControl::parse(&text) {
                ClientControl::Stop => return InboundEnd::Stop,
                ClientControl::KeepAlive => debug!("client keepalive"),
                ClientControl::Unknown(kind) => {
                    debug!(%kind, "ignoring text message while streaming");
                }
            },
            Inbound::Disconnected => return InboundEnd::Disconnected,
            Inbound::Overloaded => return InboundEnd::Failed(RelayError::ClientOverloaded),
        }
    }
}

async fn send_with_retry(
    upstream: &mut UpstreamHandle,
    frame: Bytes,
    settings: &RelaySettings,
) -> Result<(), UpstreamError> {
    let mut attempt = 0;
    loop {
        match upstream.send(frame.clone()).await {
            Err(UpstreamError::TransientSendFailure(reason)) if attempt < settings.send_retry_attempts => {
                attempt += 1;
                warn!(attempt, %reason, "upstream send failed, retrying");
                tokio::time::sleep(settings.send_retry_backoff.saturating_mul(attempt)).await;
            }
            other => return other,
        }
    }
}

/// Resolves once nothing has moved for `idle`.
async fn idle_elapsed(activity: &Activity, idle: Duration) {
    loop {
        let deadline = activity.last() + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
