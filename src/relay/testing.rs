//! In-memory stand-ins for the recognition service and the client socket.
//!
//! Every fake records what the relay did to it so tests can assert on call
//! counts and ordering without a network.

use crate::relay::client::{ClientClose, ClientGone, ClientSink};
use crate::relay::error::UpstreamError;
use crate::relay::event::{TranscriptEvent, CLOSE_UPSTREAM};
use crate::relay::format::{AudioFormat, RecognitionOptions};
use crate::relay::upstream::{UpstreamConnection, UpstreamConnector, UpstreamSink};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct UpstreamScript {
    events_tx: Option<mpsc::UnboundedSender<TranscriptEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<TranscriptEvent>>,
    sent: Vec<Bytes>,
    closes: usize,
    transient_failures: u32,
    fail_permanently: bool,
    hold_open_after_close: bool,
    send_delay: Option<Duration>,
}

/// Scripted recognition connection.
///
/// Results are whatever the test `emit`s. Closing the sink answers with
/// `close(upstream_closed)` and ends the result stream, like a real service
/// flushing on `CloseStream`, unless `hold_open_after_close` was requested.
#[derive(Clone)]
pub struct ScriptedUpstream {
    script: Arc<Mutex<UpstreamScript>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = UpstreamScript {
            events_tx: Some(tx),
            events_rx: Some(rx),
            ..UpstreamScript::default()
        };
        Self { script: Arc::new(Mutex::new(script)) }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, UpstreamScript> {
        self.script.lock().unwrap()
    }

    /// Both halves of the connection. Can be called once.
    pub fn connection(&self) -> UpstreamConnection {
        let rx = self.script().events_rx.take().expect("connection already taken");
        UpstreamConnection {
            sink: Box::new(ScriptedSink { script: self.script.clone() }),
            results: UnboundedReceiverStream::new(rx).boxed(),
        }
    }

    pub fn emit(&self, event: TranscriptEvent) {
        if let Some(tx) = self.script().events_tx.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// End the result stream without a terminal event.
    pub fn finish(&self) {
        self.script().events_tx = None;
    }

    /// The next `count` sends fail with a transient error.
    pub fn fail_sends(&self, count: u32) {
        self.script().transient_failures = count;
    }

    /// Every send fails with a transient error.
    pub fn fail_permanently(&self) {
        self.script().fail_permanently = true;
    }

    pub fn hold_open_after_close(&self) {
        self.script().hold_open_after_close = true;
    }

    pub fn delay_sends(&self, delay: Duration) {
        self.script().send_delay = Some(delay);
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.script().sent.clone()
    }

    pub fn close_count(&self) -> usize {
        self.script().closes
    }
}

struct ScriptedSink {
    script: Arc<Mutex<UpstreamScript>>,
}

#[async_trait]
impl UpstreamSink for ScriptedSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), UpstreamError> {
        let delay = self.script.lock().unwrap().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        if script.fail_permanently {
            return Err(UpstreamError::TransientSendFailure("scripted failure".into()));
        }
        if script.transient_failures > 0 {
            script.transient_failures -= 1;
            return Err(UpstreamError::TransientSendFailure("scripted hiccup".into()));
        }
        script.sent.push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        let mut script = self.script.lock().unwrap();
        script.closes += 1;
        if script.hold_open_after_close {
            return;
        }
        if let Some(tx) = script.events_tx.take() {
            let _ = tx.send(TranscriptEvent::close(CLOSE_UPSTREAM));
        }
    }
}

enum OpenBehavior {
    Succeed(ScriptedUpstream),
    Fail(UpstreamError),
    Hang,
}

/// Connector handing out one scripted upstream and recording every `open`.
#[derive(Clone)]
pub struct ScriptedConnector {
    behavior: Arc<Mutex<OpenBehavior>>,
    opened: Arc<Mutex<Vec<AudioFormat>>>,
}

impl ScriptedConnector {
    fn with(behavior: OpenBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn new(upstream: ScriptedUpstream) -> Self {
        Self::with(OpenBehavior::Succeed(upstream))
    }

    pub fn failing(err: UpstreamError) -> Self {
        Self::with(OpenBehavior::Fail(err))
    }

    /// `open` never resolves.
    pub fn hanging() -> Self {
        Self::with(OpenBehavior::Hang)
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn opened_formats(&self) -> Vec<AudioFormat> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn open(
        &self,
        format: &AudioFormat,
        _options: &RecognitionOptions,
    ) -> Result<UpstreamConnection, UpstreamError> {
        self.opened.lock().unwrap().push(format.clone());

        let outcome = match &*self.behavior.lock().unwrap() {
            OpenBehavior::Succeed(upstream) => Some(Ok(upstream.connection())),
            OpenBehavior::Fail(err) => Some(Err(err.clone())),
            OpenBehavior::Hang => None,
        };
        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct ClientRecord {
    events: Vec<TranscriptEvent>,
    closes: Vec<ClientClose>,
    write_attempts: usize,
    gone: bool,
    write_delay: Option<Duration>,
}

/// Client socket that records everything written to it.
#[derive(Clone, Default)]
pub struct RecordingClient {
    record: Arc<Mutex<ClientRecord>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later writes fail as if the peer went away.
    pub fn disconnect(&self) {
        self.record.lock().unwrap().gone = true;
    }

    pub fn slow_writes(&self, delay: Duration) {
        self.record.lock().unwrap().write_delay = Some(delay);
    }

    pub fn events(&self) -> Vec<TranscriptEvent> {
        self.record.lock().unwrap().events.clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(TranscriptEvent::kind).collect()
    }

    pub fn closes(&self) -> Vec<ClientClose> {
        self.record.lock().unwrap().closes.clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.record.lock().unwrap().write_attempts
    }
}

#[async_trait]
impl ClientSink for RecordingClient {
    async fn send(&mut self, event: &TranscriptEvent) -> Result<(), ClientGone> {
        let delay = self.record.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut record = self.record.lock().unwrap();
        record.write_attempts += 1;
        if record.gone {
            return Err(ClientGone);
        }
        record.events.push(event.clone());
        Ok(())
    }

    fn close(&mut self, how: ClientClose) {
        self.record.lock().unwrap().closes.push(how);
    }
}
