//! # Session State Machine driver
//!
//! Runs one session from socket open to release:
//!
//! 1. **AwaitingConfig**: wait (bounded) for the handshake message and validate it.
//!    Nothing is opened upstream until the handshake is valid.
//! 2. Open the upstream with the negotiated format, bounded by the connect timeout.
//! 3. **Streaming**: hand both ends to [`relay`].
//! 4. **Closing → Closed/Failed**: [`SessionResources::release`].
//!
//! A cancelled shutdown token at any stage ends the session with a
//! `server_shutdown` close.

use crate::config::{AppConfig, AudioDefaults};
use crate::relay::client::{ClientFrame, ClientHandle, ClientInbound, Inbound};
use crate::relay::error::RelayError;
use crate::relay::event::CLOSE_SERVER_SHUTDOWN;
use crate::relay::format::StreamConfig;
use crate::relay::registry::Registration;
use crate::relay::relay_loop::{relay, RelaySettings};
use crate::relay::session::{Session, SessionState};
use crate::relay::teardown::{SessionEnd, SessionResources};
use crate::relay::upstream::{UpstreamConnector, UpstreamHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Everything a session needs from configuration, captured when it starts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on closing the upstream connection
    pub close_timeout: Duration,
    pub audio: AudioDefaults,
    pub relay: RelaySettings,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let session = &config.session;
        Self {
            handshake_timeout: session.handshake_timeout(),
            connect_timeout: config.upstream.connect_timeout(),
            close_timeout: session.shutdown_timeout(),
            audio: config.audio.clone(),
            relay: RelaySettings {
                idle_timeout: session.idle_timeout(),
                grace_period: session.grace_period(),
                outbound_capacity: session.outbound_queue_capacity,
                send_retry_attempts: session.send_retry_attempts,
                send_retry_backoff: session.send_retry_backoff(),
            },
        }
    }
}

pub struct SessionDriver {
    resources: SessionResources,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
}

impl SessionDriver {
    pub fn new(
        registration: Registration,
        client: ClientHandle,
        connector: Arc<dyn UpstreamConnector>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            resources: SessionResources::new(registration, client),
            connector,
            settings,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.resources.session()
    }

    /// Drive the session to a terminal state and release it.
    pub async fn run(self, inbound: ClientInbound) -> SessionState {
        let span = info_span!("session", session_id = %self.session().id);
        self.drive(inbound).instrument(span).await
    }

    async fn drive(mut self, mut inbound: ClientInbound) -> SessionState {
        let session = self.session().clone();
        let shutdown = session.shutdown_token();
        info!("session started, awaiting configuration");

        let end = match self.negotiate(&mut inbound, &shutdown).await {
            Err(end) => end,
            Ok(upstream) => {
                self.resources.attach_upstream(upstream);
                match self.resources.ends() {
                    Some((upstream, client)) => {
                        let report =
                            relay(upstream, client, &mut inbound, &self.settings.relay, &shutdown).await;
                        info!(
                            frames = report.frames_forwarded,
                            events = report.events_delivered,
                            dropped_interim = report.dropped_interim,
                            "stream finished"
                        );
                        self.record_dropped(report.dropped_interim);
                        report.end
                    }
                    None => SessionEnd::Failed(RelayError::UpstreamStreamError(
                        "upstream handle missing".to_string(),
                    )),
                }
            }
        };

        inbound.close();
        self.resources.release(&end).await
    }

    fn record_dropped(&self, count: u64) {
        self.resources.registry().record_dropped_interim(count);
    }

    /// AwaitingConfig: handshake, then open the upstream and enter Streaming.
    async fn negotiate(
        &mut self,
        inbound: &mut ClientInbound,
        shutdown: &CancellationToken,
    ) -> Result<UpstreamHandle, SessionEnd> {
        let config = self.await_handshake(inbound, shutdown).await?;
        let format = &config.format;
        info!(
            encoding = %format.encoding,
            sample_rate = format.sample_rate,
            channels = format.channels,
            model = %format.model,
            language = %format.language,
            "configuration accepted, opening upstream"
        );

        let opening = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.open(&config.format, &config.options),
        );
        let connection = tokio::select! {
            opened = opening => match opened {
                Ok(Ok(connection)) => connection,
                Ok(Err(err)) => {
                    warn!(error = %err, "upstream open failed");
                    return Err(SessionEnd::Failed(err.into()));
                }
                Err(_) => {
                    return Err(SessionEnd::Failed(RelayError::UpstreamUnreachable(format!(
                        "no response within {} ms",
                        self.settings.connect_timeout.as_millis()
                    ))));
                }
            },
            _ = shutdown.cancelled() => return Err(SessionEnd::Completed(CLOSE_SERVER_SHUTDOWN)),
        };

        let upstream = UpstreamHandle::new(connection, self.settings.close_timeout);
        if let Err(err) = self.session().begin_streaming(config.format) {
            // Dropping the handle closes the fresh connection.
            return Err(SessionEnd::Failed(RelayError::UpstreamStreamError(err.to_string())));
        }
        info!("upstream ready, streaming");
        Ok(upstream)
    }

    async fn await_handshake(
        &mut self,
        inbound: &mut ClientInbound,
        shutdown: &CancellationToken,
    ) -> Result<StreamConfig, SessionEnd> {
        let timeout = self.settings.handshake_timeout;
        let received = tokio::select! {
            received = tokio::time::timeout(timeout, inbound.recv()) => received,
            _ = shutdown.cancelled() => return Err(SessionEnd::Completed(CLOSE_SERVER_SHUTDOWN)),
        };

        match received {
            Err(_) => Err(SessionEnd::Failed(RelayError::ConfigInvalid(format!(
                "no configuration message within {} ms",
                timeout.as_millis()
            )))),
            Ok(Inbound::Frame(ClientFrame::Text(text))) => {
                StreamConfig::from_handshake(&text, &self.settings.audio).map_err(SessionEnd::Failed)
            }
            Ok(Inbound::Frame(ClientFrame::Binary(_))) => Err(SessionEnd::Failed(
                RelayError::ConfigInvalid("audio received before the configuration message".to_string()),
            )),
            Ok(Inbound::Disconnected) => Err(SessionEnd::Failed(RelayError::ClientDisconnected)),
            Ok(Inbound::Overloaded) => Err(SessionEnd::Failed(RelayError::ClientOverloaded)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::{client_channel, ClientClose, ClientFeed};
    use crate::relay::error::UpstreamError;
    use crate::relay::event::{TranscriptEvent, CLOSE_UPSTREAM};
    use crate::relay::registry::SessionRegistry;
    use crate::relay::testing::{RecordingClient, ScriptedConnector, ScriptedUpstream};
    use bytes::Bytes;
    use uuid::Uuid;

    const HANDSHAKE: &str = r#"{"encoding": "linear16", "sampleRate": 16000, "channels": 1}"#;

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::from_config(&AppConfig::default());
        settings.handshake_timeout = Duration::from_secs(2);
        settings.relay.grace_period = Duration::from_millis(500);
        settings
    }

    struct Started {
        registry: Arc<SessionRegistry>,
        session: Arc<Session>,
        client: RecordingClient,
        feed: ClientFeed,
        task: tokio::task::JoinHandle<SessionState>,
    }

    fn start(connector: &ScriptedConnector, settings: SessionSettings) -> Started {
        let registry = Arc::new(SessionRegistry::new(8));
        let session = Arc::new(Session::new(Uuid::new_v4()));
        let registration = registry.register(session.clone()).unwrap();
        let client = RecordingClient::new();
        let (feed, inbound) = client_channel(64);

        let driver = SessionDriver::new(
            registration,
            ClientHandle::new(Box::new(client.clone())),
            Arc::new(connector.clone()),
            settings,
        );
        let task = tokio::spawn(driver.run(inbound));
        Started { registry, session, client, feed, task }
    }

    #[tokio::test]
    async fn test_three_frames_then_disconnect() {
        let upstream = ScriptedUpstream::new();
        let connector = ScriptedConnector::new(upstream.clone());
        let mut s = start(&connector, settings());

        s.feed.push(ClientFrame::Text(HANDSHAKE.into())).unwrap();
        for chunk in [b"aa", b"bb", b"cc"] {
            s.feed.push(ClientFrame::Binary(Bytes::from_static(chunk))).unwrap();
        }
        s.feed.disconnect();

        assert_eq!(s.task.await.unwrap(), SessionState::Closed);
        assert_eq!(
            upstream.sent_frames(),
            vec![Bytes::from_static(b"aa"), Bytes::from_static(b"bb"), Bytes::from_static(b"cc")]
        );
        assert_eq!(upstream.close_count(), 1);
        assert!(s.registry.find(s.session.id).is_none());
        // Client left on its own: no terminal message.
        assert!(s.client.events().is_empty());

        let format = &connector.opened_formats()[0];
        assert_eq!((format.encoding.as_str(), format.sample_rate, format.channels), ("linear16", 16_000, 1));
    }

    #[tokio::test]
    async fn test_relays_transcripts_then_close() {
        let upstream = ScriptedUpstream::new();
        upstream.emit(TranscriptEvent::interim("hel"));
        upstream.emit(TranscriptEvent::interim("hello"));
        upstream.emit(TranscriptEvent::final_result("hello world"));
        upstream.emit(TranscriptEvent::close(CLOSE_UPSTREAM));
        let connector = ScriptedConnector::new(upstream.clone());
        let mut s = start(&connector, settings());

        s.feed.push(ClientFrame::Text(HANDSHAKE.into())).unwrap();

        assert_eq!(s.task.await.unwrap(), SessionState::Closed);
        assert_eq!(s.client.kinds(), vec!["interim", "interim", "final", "close"]);
        assert_eq!(s.client.closes(), vec![ClientClose::Normal]);
        assert_eq!(s.session.format().map(|f| f.sample_rate), Some(16_000));
    }

    #[tokio::test]
    async fn test_missing_field_never_opens_upstream() {
        let connector = ScriptedConnector::new(ScriptedUpstream::new());
        let mut s = start(&connector, settings());

        s.feed.push(ClientFrame::Text(r#"{"encoding": "linear16"}"#.into())).unwrap();

        assert_eq!(s.task.await.unwrap(), SessionState::Failed);
        assert_eq!(connector.open_count(), 0);
        let events = s.client.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TranscriptEvent::Error { code, .. } if code == "config_invalid"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_reports_one_error() {
        let connector = ScriptedConnector::failing(UpstreamError::Unreachable("refused".into()));
        let mut s = start(&connector, settings());

        s.feed.push(ClientFrame::Text(HANDSHAKE.into())).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(1), s.task).await.unwrap().unwrap();
        assert_eq!(state, SessionState::Failed);
        assert_eq!(s.client.kinds(), vec!["error"]);
        assert_eq!(s.client.closes(), vec![ClientClose::Error]);
        assert!(s.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let connector = ScriptedConnector::new(ScriptedUpstream::new());
        let s = start(&connector, settings());

        assert_eq!(s.task.await.unwrap(), SessionState::Failed);
        assert_eq!(connector.open_count(), 0);
        assert_eq!(s.client.kinds(), vec!["error"]);
        drop(s.feed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_unreachable() {
        let connector = ScriptedConnector::hanging();
        let mut s = start(&connector, settings());
        s.feed.push(ClientFrame::Text(HANDSHAKE.into())).unwrap();

        assert_eq!(s.task.await.unwrap(), SessionState::Failed);
        let events = s.client.events();
        assert!(matches!(&events[..], [TranscriptEvent::Error { code, .. }] if code == "upstream_unreachable"));
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_is_silent() {
        let connector = ScriptedConnector::new(ScriptedUpstream::new());
        let mut s = start(&connector, settings());
        s.feed.disconnect();

        assert_eq!(s.task.await.unwrap(), SessionState::Closed);
        assert!(s.client.events().is_empty());
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_audio_before_handshake_is_invalid() {
        let connector = ScriptedConnector::new(ScriptedUpstream::new());
        let mut s = start(&connector, settings());
        s.feed.push(ClientFrame::Binary(Bytes::from_static(b"pcm"))).unwrap();

        assert_eq!(s.task.await.unwrap(), SessionState::Failed);
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_shutdown_closes_streaming_session() {
        let upstream = ScriptedUpstream::new();
        let connector = ScriptedConnector::new(upstream.clone());
        let mut s = start(&connector, settings());
        s.feed.push(ClientFrame::Text(HANDSHAKE.into())).unwrap();

        while s.session.state() != SessionState::Streaming {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let remaining = s.registry.shutdown_all(Duration::from_secs(1)).await;

        assert_eq!(remaining, 0);
        assert_eq!(s.task.await.unwrap(), SessionState::Closed);
        assert_eq!(s.client.kinds(), vec!["close"]);
        assert_eq!(s.client.closes(), vec![ClientClose::Shutdown]);
        assert_eq!(upstream.close_count(), 1);
    }
}
