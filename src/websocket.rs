//! # WebSocket Relay Handler
//!
//! Accepts client sockets on `/` and `/ws/listen` and binds each one to a relay
//! session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the session is registered before the upgrade; a full
//!    registry answers 503 instead of upgrading
//! 2. **Configuration**: the first message is a JSON handshake (`relay::format`)
//! 3. **Audio Streaming**: binary frames, forwarded upstream unchanged
//! 4. **Transcripts**: `{"type": "interim" | "final" | "error" | "close", "transcript": ...}`
//! 5. **Stop**: `{"type": "stop"}` or `{"type": "CloseStream"}` flushes and closes
//!
//! ## Actor Model:
//! Each socket is an actix actor. It only moves frames: inbound frames go into the
//! session's bounded feed, and the session task writes back through the actor's
//! mailbox (`Outbound`, `CloseSocket`). The session itself runs on a spawned
//! tokio task driven by `relay::SessionDriver`.

use crate::error::AppError;
use crate::relay::{
    client_channel, ClientClose, ClientFeed, ClientFrame, ClientGone, ClientHandle, ClientSink,
    Session, SessionDriver, SessionSettings, TranscriptEvent, UpstreamConnector,
};
use crate::relay::client::{ClientInbound, FeedError};
use crate::relay::registry::Registration;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Text message for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(String);

/// Close the socket and stop the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket(ClientClose);

/// Session pieces held until the actor has an address to write to.
struct PendingSession {
    registration: Registration,
    inbound: ClientInbound,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
}

/// WebSocket actor for one relay client.
pub struct RelaySocket {
    session_id: Uuid,

    /// Inbound frames towards the session task
    feed: ClientFeed,

    /// Taken in `started`
    pending: Option<PendingSession>,

    heartbeat_interval: Duration,

    last_heartbeat: Instant,
}

impl RelaySocket {
    fn new(session_id: Uuid, feed: ClientFeed, pending: PendingSession, heartbeat_interval: Duration) -> Self {
        Self {
            session_id,
            feed,
            pending: Some(pending),
            heartbeat_interval,
            last_heartbeat: Instant::now(),
        }
    }

    fn push(&mut self, frame: ClientFrame) {
        match self.feed.push(frame) {
            Ok(()) => {}
            Err(FeedError::Overloaded) => {
                warn!(session_id = %self.session_id, "client is sending faster than the upstream accepts");
            }
            Err(FeedError::Closed) => {
                debug!(session_id = %self.session_id, "frame after session stopped reading");
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Start the session task and the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        if let Some(pending) = self.pending.take() {
            let sink = ActorSink { addr: ctx.address() };
            let driver = SessionDriver::new(
                pending.registration,
                ClientHandle::new(Box::new(sink)),
                pending.connector,
                pending.settings,
            );
            tokio::spawn(driver.run(pending.inbound));
        }

        let interval = self.heartbeat_interval;
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > interval.saturating_mul(2) {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                act.feed.disconnect();
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // The session sees this as a client disconnect.
        self.feed.disconnect();
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.push(ClientFrame::Text(text.to_string())),
            Ok(ws::Message::Binary(data)) => self.push(ClientFrame::Binary(data)),
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, ?reason, "client closed the socket");
                self.feed.disconnect();
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                self.feed.disconnect();
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(close_reason(msg.0)));
        ctx.stop();
    }
}

fn close_reason(how: ClientClose) -> ws::CloseReason {
    match how {
        ClientClose::Normal => ws::CloseCode::Normal.into(),
        ClientClose::Error => ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some("session failed".to_string()),
        },
        ClientClose::Shutdown => ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some("server shutting down".to_string()),
        },
    }
}

/// Writes session events through the actor mailbox. `send` waits for mailbox
/// space, so a slow socket pushes back on the session's writer.
struct ActorSink {
    addr: Addr<RelaySocket>,
}

#[async_trait]
impl ClientSink for ActorSink {
    async fn send(&mut self, event: &TranscriptEvent) -> Result<(), ClientGone> {
        let text = serde_json::to_string(event).map_err(|e| {
            error!(error = %e, "failed to encode transcript event");
            ClientGone
        })?;
        self.addr.send(Outbound(text)).await.map_err(|_| ClientGone)
    }

    fn close(&mut self, how: ClientClose) {
        self.addr.do_send(CloseSocket(how));
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Registers the session first so capacity and shutdown are enforced before
/// the upgrade; the `RelaySocket` actor takes it from there.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let session = Arc::new(Session::new(Uuid::new_v4()));
    let registration = state.registry.register(session.clone()).map_err(AppError::from)?;

    let config = state.get_config();
    let (feed, inbound) = client_channel(config.session.inbound_queue_capacity);
    let pending = PendingSession {
        registration,
        inbound,
        connector: state.connector.clone(),
        settings: SessionSettings::from_config(&config),
    };

    let socket = RelaySocket::new(session.id, feed, pending, config.session.heartbeat_interval());
    ws::start(socket, &req, stream)
}

/// `GET /`: the listen socket for WebSocket upgrades, a banner otherwise.
pub async fn index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    if is_websocket_upgrade(&req) {
        return relay_websocket(req, stream, state).await;
    }
    Ok(HttpResponse::Ok().json(json!({ "message": "Speech Relay Server" })))
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::testing::{ScriptedConnector, ScriptedUpstream};
    use crate::relay::event::CLOSE_CLIENT_STOP;
    use crate::state::tests::test_state;
    use actix_web::{test, App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;

    #[actix_web::test]
    async fn test_close_codes() {
        assert_eq!(close_reason(ClientClose::Normal).code, ws::CloseCode::Normal);
        assert_eq!(close_reason(ClientClose::Error).code, ws::CloseCode::Error);
        assert_eq!(close_reason(ClientClose::Shutdown).code, ws::CloseCode::Away);
    }

    #[actix_web::test]
    async fn test_index_without_upgrade_returns_banner() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/", web::get().to(index)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "Speech Relay Server");
    }

    #[actix_web::test]
    async fn test_full_registry_refuses_upgrade() {
        let state = test_state();
        state.registry.set_max_sessions(0);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws/listen", web::get().to(relay_websocket)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/ws/listen")
            .insert_header((header::UPGRADE, "websocket"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_failed_upgrade_releases_registration() {
        let state = test_state();
        let registry = state.registry.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws/listen", web::get().to(relay_websocket)),
        )
        .await;

        // No WebSocket handshake headers: the upgrade is refused.
        let resp = test::call_service(&app, test::TestRequest::get().uri("/ws/listen").to_request()).await;
        assert!(resp.status().is_client_error());
        assert!(registry.is_empty());
    }

    #[actix_web::test]
    async fn test_socket_streams_a_session_end_to_end() {
        let upstream = ScriptedUpstream::new();
        upstream.emit(TranscriptEvent::interim("hel"));
        upstream.emit(TranscriptEvent::interim("hello"));
        upstream.emit(TranscriptEvent::final_result("hello world"));

        let mut config = AppConfig::default();
        config.upstream.api_key = Some("dg-test-key".to_string());
        let state = AppState::new(config, Arc::new(ScriptedConnector::new(upstream.clone()))).unwrap();
        let registry = state.registry.clone();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/listen", web::get().to(relay_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());

        let (mut socket, _) = connect_async(format!("ws://{}/ws/listen", addr)).await.unwrap();
        socket
            .send(Message::Text(r#"{"encoding": "linear16", "sampleRate": 16000, "channels": 1}"#.into()))
            .await
            .unwrap();
        for chunk in [b"aa", b"bb", b"cc"] {
            socket.send(Message::Binary(chunk.to_vec())).await.unwrap();
        }
        socket.send(Message::Text(r#"{"type": "stop"}"#.into())).await.unwrap();

        let mut events = Vec::new();
        let mut close_code = None;
        while let Some(message) = tokio::time::timeout(Duration::from_secs(5), socket.next()).await.unwrap() {
            match message.unwrap() {
                Message::Text(text) => events.push(serde_json::from_str::<TranscriptEvent>(&text).unwrap()),
                Message::Close(frame) => {
                    close_code = frame.map(|frame| frame.code);
                    break;
                }
                _ => {}
            }
        }

        let kinds: Vec<_> = events.iter().map(TranscriptEvent::kind).collect();
        assert_eq!(kinds, vec!["interim", "interim", "final", "close"]);
        assert_eq!(events[3], TranscriptEvent::close(CLOSE_CLIENT_STOP));
        assert_eq!(close_code, Some(CloseCode::Normal));
        assert_eq!(
            upstream.sent_frames(),
            vec![
                bytes::Bytes::from_static(b"aa"),
                bytes::Bytes::from_static(b"bb"),
                bytes::Bytes::from_static(b"cc")
            ]
        );

        // The session task releases its registration after the socket closes.
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
    }
}
