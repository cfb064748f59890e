//! # Deepgram live transcription connector
//!
//! Opens `wss://api.deepgram.com/v1/listen` with the negotiated format and
//! options as query parameters and `Authorization: Token <key>`.
//!
//! ## Wire protocol:
//! - **Audio**: binary WebSocket messages, forwarded as-is
//! - **Results**: JSON text messages; only `"type": "Results"` carries a transcript,
//!   the rest (`Metadata`, `SpeechStarted`, `UtteranceEnd`) are skipped
//! - **Finish**: the text message `{"type": "CloseStream"}` asks Deepgram to flush
//!   pending results and close the socket
//!
//! Connection errors are classified from the HTTP upgrade response: 401/403 are
//! credential problems, 400/422 mean the format or options were refused.

use crate::config::UpstreamConfig;
use crate::relay::error::UpstreamError;
use crate::relay::event::{TranscriptEvent, Utterance, CLOSE_UPSTREAM};
use crate::relay::format::{AudioFormat, RecognitionOptions};
use crate::relay::upstream::{EventStream, UpstreamConnection, UpstreamConnector, UpstreamSink};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type DeepgramSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

pub struct DeepgramConnector {
    url: Url,
    api_key: String,
}

impl DeepgramConnector {
    pub fn new(url: &str, api_key: impl Into<String>) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| anyhow!("invalid upstream url '{}': {}", url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!("upstream url must use ws:// or wss://, got '{}'", url.scheme()));
        }
        Ok(Self { url, api_key: api_key.into() })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("DEEPGRAM_API_KEY is not set"))?;
        Self::new(&config.url, api_key)
    }

    /// Listen URL with every option as a query parameter.
    pub fn listen_url(&self, format: &AudioFormat, options: &RecognitionOptions) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("model", &format.model)
            .append_pair("language", &format.language)
            .append_pair("encoding", &format.encoding)
            .append_pair("sample_rate", &format.sample_rate.to_string())
            .append_pair("channels", &format.channels.to_string())
            .append_pair("interim_results", flag(format.interim_results))
            .append_pair("smart_format", flag(options.smart_format))
            .append_pair("punctuate", flag(options.punctuate))
            .append_pair("diarize", flag(options.diarize))
            .append_pair("utterances", flag(options.utterances));
        url
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl UpstreamConnector for DeepgramConnector {
    async fn open(
        &self,
        format: &AudioFormat,
        options: &RecognitionOptions,
    ) -> Result<UpstreamConnection, UpstreamError> {
        let url = self.listen_url(format, options);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        let token = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|_| UpstreamError::AuthFailed("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, token);

        let (socket, response) = connect_async(request).await.map_err(classify_connect_error)?;
        debug!(status = response.status().as_u16(), "deepgram connection established");

        let (write, read) = socket.split();
        Ok(UpstreamConnection {
            sink: Box::new(DeepgramSink { write }),
            results: result_stream(read),
        })
    }
}

fn classify_connect_error(err: tungstenite::Error) -> UpstreamError {
    match err {
        tungstenite::Error::Http(response) => {
            let detail = response
                .body()
                .as_deref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .filter(|body| !body.is_empty())
                .unwrap_or_else(|| response.status().to_string());
            classify_status(response.status().as_u16(), detail)
        }
        other => UpstreamError::Unreachable(other.to_string()),
    }
}

fn classify_status(status: u16, detail: String) -> UpstreamError {
    match status {
        401 | 403 => UpstreamError::AuthFailed(detail),
        400 | 422 => UpstreamError::RejectedFormat(detail),
        _ => UpstreamError::Unreachable(format!("HTTP {}: {}", status, detail)),
    }
}

struct DeepgramSink {
    write: SplitSink<DeepgramSocket, Message>,
}

#[async_trait]
impl UpstreamSink for DeepgramSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), UpstreamError> {
        self.write
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(classify_send_error)
    }

    async fn close(&mut self) {
        if let Err(err) = self.write.send(Message::Text(CLOSE_STREAM.to_string())).await {
            debug!(error = %err, "CloseStream not delivered");
        }
    }
}

fn classify_send_error(err: tungstenite::Error) -> UpstreamError {
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(_) => UpstreamError::UpstreamClosed,
        other => UpstreamError::TransientSendFailure(other.to_string()),
    }
}

/// Decode the read half into transcript events. The stream ends after the
/// first terminal event.
fn result_stream(read: SplitStream<DeepgramSocket>) -> EventStream {
    stream::unfold(Some(read), |state| async move {
        let mut read = state?;
        loop {
            let event = match read.next().await {
                Some(Ok(Message::Text(text))) => match parse_message(&text) {
                    Some(event) => event,
                    None => continue,
                },
                Some(Ok(Message::Close(frame))) => match frame {
                    Some(frame) if frame.code != CloseCode::Normal => {
                        warn!(code = u16::from(frame.code), reason = %frame.reason, "deepgram closed with error");
                        stream_error(format!("closed with code {}: {}", u16::from(frame.code), frame.reason))
                    }
                    _ => TranscriptEvent::close(CLOSE_UPSTREAM),
                },
                Some(Ok(_)) => continue,
                Some(Err(err)) => stream_error(err.to_string()),
                None => TranscriptEvent::close(CLOSE_UPSTREAM),
            };
            let next = if event.is_terminal() { None } else { Some(read) };
            return Some((event, next));
        }
    })
    .boxed()
}

fn stream_error(message: String) -> TranscriptEvent {
    TranscriptEvent::Error {
        transcript: String::new(),
        code: "upstream_stream_error".to_string(),
        message,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results {
        channel: ResultChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
        #[serde(default)]
        start: Option<f64>,
        #[serde(default)]
        duration: Option<f64>,
    },
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// One Deepgram text message → event, or `None` for messages clients never see.
fn parse_message(text: &str) -> Option<TranscriptEvent> {
    let message = match serde_json::from_str::<DeepgramMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "skipping unrecognised deepgram message");
            return None;
        }
    };

    match message {
        DeepgramMessage::Results { channel, is_final, speech_final, start, duration } => {
            let best = channel.alternatives.into_iter().next()?;
            let utterance = Utterance {
                transcript: best.transcript,
                confidence: best.confidence,
                start,
                duration,
                speech_final: is_final && speech_final,
            };
            Some(if is_final {
                TranscriptEvent::Final(utterance)
            } else {
                TranscriptEvent::Interim(utterance)
            })
        }
        DeepgramMessage::Error { description, message } => Some(stream_error(
            description.or(message).unwrap_or_else(|| "unspecified error".to_string()),
        )),
        DeepgramMessage::Other => None,
    }
}
