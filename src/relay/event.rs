//! Messages exchanged with relay clients once a session is streaming.
//!
//! Server → client: one JSON object per [`TranscriptEvent`], tagged by `type`:
//! ```json
//! {"type": "interim", "transcript": "hel", "confidence": 0.91, "speech_final": false}
//! {"type": "final", "transcript": "hello world", "speech_final": true}
//! {"type": "error", "transcript": "", "code": "upstream_unreachable", "message": "..."}
//! {"type": "close", "transcript": "", "reason": "upstream_closed"}
//! ```
//!
//! Client → server after the handshake: binary audio frames, plus the text
//! control messages understood by [`ClientControl`].

use crate::relay::error::RelayError;
use serde::{Deserialize, Serialize};

/// Close reason when the recognition service finished the stream.
pub const CLOSE_UPSTREAM: &str = "upstream_closed";
/// Close reason after the client asked to stop.
pub const CLOSE_CLIENT_STOP: &str = "client_stop";
/// Close reason when the process is shutting down.
pub const CLOSE_SERVER_SHUTDOWN: &str = "server_shutdown";

/// One recognition result as relayed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub transcript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Offset of the result in the audio stream, seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// End-of-utterance marker; only ever true on `final` results
    #[serde(default)]
    pub speech_final: bool,
}

impl Utterance {
    pub fn text(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            confidence: None,
            start: None,
            duration: None,
            speech_final: false,
        }
    }
}

/// A transcript event produced by the upstream and relayed, in order, to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Interim(Utterance),
    Final(Utterance),
    Error {
        #[serde(default)]
        transcript: String,
        code: String,
        message: String,
    },
    Close {
        #[serde(default)]
        transcript: String,
        reason: String,
    },
}

impl TranscriptEvent {
    pub fn interim(transcript: impl Into<String>) -> Self {
        TranscriptEvent::Interim(Utterance::text(transcript))
    }

    /// A final result that also ends the utterance.
    pub fn final_result(transcript: impl Into<String>) -> Self {
        TranscriptEvent::Final(Utterance {
            speech_final: true,
            ..Utterance::text(transcript)
        })
    }

    pub fn error(err: &RelayError) -> Self {
        TranscriptEvent::Error {
            transcript: String::new(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn close(reason: &str) -> Self {
        TranscriptEvent::Close {
            transcript: String::new(),
            reason: reason.to_string(),
        }
    }

    /// `error` and `close` end the event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TranscriptEvent::Error { .. } | TranscriptEvent::Close { .. })
    }

    /// Only interim results may be shed under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, TranscriptEvent::Interim(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptEvent::Interim(_) => "interim",
            TranscriptEvent::Final(_) => "final",
            TranscriptEvent::Error { .. } => "error",
            TranscriptEvent::Close { .. } => "close",
        }
    }

    pub fn transcript(&self) -> &str {
        match self {
            TranscriptEvent::Interim(u) | TranscriptEvent::Final(u) => &u.transcript,
            TranscriptEvent::Error { transcript, .. } | TranscriptEvent::Close { transcript, .. } => {
                transcript
            }
        }
    }
}

/// Text messages a client may send while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientControl {
    /// Finish the stream: flush remaining results, then close
    Stop,
    /// Liveness only; nothing is forwarded
    KeepAlive,
    Unknown(String),
}

impl ClientControl {
    pub fn parse(text: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
        }

        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => match envelope.kind.to_ascii_lowercase().as_str() {
                "stop" | "closestream" | "close_stream" | "finalize" => ClientControl::Stop,
                "keepalive" | "keep_alive" | "ping" => ClientControl::KeepAlive,
                other => ClientControl::Unknown(other.to_string()),
            },
            Err(_) => ClientControl::Unknown(text.chars().take(64).collect()),
        }
    }
}
