//! # Session record and lifecycle state
//!
//! ## Session Lifecycle:
//! ```text
//! AWAITING_CONFIG ──► STREAMING ──► CLOSING ──► CLOSED
//!        │                │            │
//!        └────────────────┴────────────┴──────► FAILED
//! ```
//! - **AwaitingConfig**: socket open, waiting for the handshake
//! - **Streaming**: upstream ready, relay loop running
//! - **Closing**: one side ended; trailing results flushing within the grace period
//! - **Closed**: orderly end, all resources released
//! - **Failed**: ended by an error, all resources released
//!
//! A client that leaves during the handshake goes straight to `Closing`.
//!
//! The [`Session`] is shared between the task driving it and the registry, but
//! only the driving task ever calls [`Session::transition`].

use crate::relay::format::AudioFormat;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingConfig,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingConfig => "awaiting_config",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (AwaitingConfig, Streaming) | (AwaitingConfig, Closing) => true,
            (Streaming, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// One client ↔ upstream pairing.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    format: OnceLock<AudioFormat>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::AwaitingConfig),
            format: OnceLock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn transition(&self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        *state = next;
        Ok(from)
    }

    /// Record the negotiated format and enter `Streaming`.
    ///
    /// The format can be set only once; a second call fails even if the state
    /// would allow it, so nothing can renegotiate mid-stream.
    pub fn begin_streaming(&self, format: AudioFormat) -> Result<(), InvalidTransition> {
        let state = self.state();
        if !state.can_transition_to(SessionState::Streaming) || self.format.get().is_some() {
            return Err(InvalidTransition { from: state, to: SessionState::Streaming });
        }
        // Only the driving task writes, so the check above cannot race.
        let _ = self.format.set(format);
        self.transition(SessionState::Streaming).map(|_| ())
    }

    pub fn format(&self) -> Option<&AudioFormat> {
        self.format.get()
    }

    /// Token the registry cancels to force this session closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state(),
            created_at: self.created_at,
            format: self.format().cloned(),
        }
    }
}

/// Serializable view of a session for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub format: Option<AudioFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormat {
        AudioFormat {
            encoding: "linear16".into(),
            sample_rate: 16_000,
            channels: 1,
            interim_results: true,
            language: "en-US".into(),
            model: "nova-3".into(),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let session = Session::new(Uuid::new_v4());
        assert_eq!(session.state(), SessionState::AwaitingConfig);

        session.begin_streaming(format()).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        session.transition(SessionState::Closing).unwrap();
        session.transition(SessionState::Closed).unwrap();
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_absorb() {
        let session = Session::new(Uuid::new_v4());
        session.transition(SessionState::Failed).unwrap();

        for next in [
            SessionState::AwaitingConfig,
            SessionState::Streaming,
            SessionState::Closing,
            SessionState::Closed,
            SessionState::Failed,
        ] {
            assert!(session.transition(next).is_err());
        }
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_failed_reachable_from_every_live_state() {
        for from in [SessionState::AwaitingConfig, SessionState::Streaming, SessionState::Closing] {
            assert!(from.can_transition_to(SessionState::Failed));
        }
        assert!(!SessionState::AwaitingConfig.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Streaming.can_transition_to(SessionState::AwaitingConfig));
    }

    #[test]
    fn test_format_is_fixed_once_streaming() {
        let session = Session::new(Uuid::new_v4());
        session.begin_streaming(format()).unwrap();

        let mut other = format();
        other.sample_rate = 44_100;
        assert!(session.begin_streaming(other).is_err());
        assert_eq!(session.format().map(|f| f.sample_rate), Some(16_000));
    }

    #[test]
    fn test_snapshot_serializes_state() {
        let session = Session::new(Uuid::new_v4());
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["state"], "awaiting_config");
        assert!(json["format"].is_null());
    }
}
