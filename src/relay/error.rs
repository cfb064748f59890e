//! Session-level error taxonomy.
//!
//! Every variant is fatal to one session only. The stable `code()` strings are
//! what clients see in the `code` field of an `error` message.

use std::fmt;

/// Failures reported by an upstream recognition connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Credential rejected during the connection handshake (401/403)
    AuthFailed(String),
    /// Could not connect, or the connect attempt timed out
    Unreachable(String),
    /// Upstream refused the negotiated audio format or options (400/422)
    RejectedFormat(String),
    /// `send` after the handle was closed
    UpstreamClosed,
    /// A single send failed but the connection may still be usable
    TransientSendFailure(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::AuthFailed(msg) => write!(f, "upstream authentication failed: {}", msg),
            UpstreamError::Unreachable(msg) => write!(f, "upstream unreachable: {}", msg),
            UpstreamError::RejectedFormat(msg) => write!(f, "upstream rejected format: {}", msg),
            UpstreamError::UpstreamClosed => write!(f, "upstream connection is closed"),
            UpstreamError::TransientSendFailure(msg) => write!(f, "upstream send failed: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Why a session ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Handshake missing, malformed, or late
    ConfigInvalid(String),
    UpstreamAuthFailed(String),
    UpstreamUnreachable(String),
    UpstreamRejectedFormat(String),
    /// Expected end of a session; never reported to the client
    ClientDisconnected,
    /// Send retries exhausted
    TransientSendFailure(String),
    /// The result stream reported an error, or the handle closed under us
    UpstreamStreamError(String),
    /// No frames and no results for longer than the idle timeout
    IdleTimeout,
    /// Client pushed frames faster than the upstream accepted them
    ClientOverloaded,
}

impl RelayError {
    /// Machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::ConfigInvalid(_) => "config_invalid",
            RelayError::UpstreamAuthFailed(_) => "upstream_auth_failed",
            RelayError::UpstreamUnreachable(_) => "upstream_unreachable",
            RelayError::UpstreamRejectedFormat(_) => "upstream_rejected_format",
            RelayError::ClientDisconnected => "client_disconnected",
            RelayError::TransientSendFailure(_) => "upstream_send_failed",
            RelayError::UpstreamStreamError(_) => "upstream_stream_error",
            RelayError::IdleTimeout => "idle_timeout",
            RelayError::ClientOverloaded => "client_overloaded",
        }
    }

    /// Whether the client should be told about this error before the socket closes.
    pub fn notifies_client(&self) -> bool {
        !matches!(self, RelayError::ClientDisconnected)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            RelayError::UpstreamAuthFailed(msg) => write!(f, "upstream authentication failed: {}", msg),
            RelayError::UpstreamUnreachable(msg) => write!(f, "upstream unreachable: {}", msg),
            RelayError::UpstreamRejectedFormat(msg) => write!(f, "upstream rejected format: {}", msg),
            RelayError::ClientDisconnected => write!(f, "client disconnected"),
            RelayError::TransientSendFailure(msg) => write!(f, "failed to forward audio: {}", msg),
            RelayError::UpstreamStreamError(msg) => write!(f, "upstream stream error: {}", msg),
            RelayError::IdleTimeout => write!(f, "session idle for too long"),
            RelayError::ClientOverloaded => {
                write!(f, "audio arrived faster than it could be forwarded")
            }
        }
    }
}

impl std::error::Error for RelayError {}

/// Open failures keep their category; send-side failures become stream errors.
impl From<UpstreamError> for RelayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::AuthFailed(msg) => RelayError::UpstreamAuthFailed(msg),
            UpstreamError::Unreachable(msg) => RelayError::UpstreamUnreachable(msg),
            UpstreamError::RejectedFormat(msg) => RelayError::UpstreamRejectedFormat(msg),
            UpstreamError::UpstreamClosed => {
                RelayError::UpstreamStreamError("upstream connection is closed".to_string())
            }
            UpstreamError::TransientSendFailure(msg) => RelayError::TransientSendFailure(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_errors_keep_category() {
        let err: RelayError = UpstreamError::AuthFailed("401".into()).into();
        assert_eq!(err.code(), "upstream_auth_failed");

        let err: RelayError = UpstreamError::Unreachable("dns".into()).into();
        assert_eq!(err.code(), "upstream_unreachable");

        let err: RelayError = UpstreamError::UpstreamClosed.into();
        assert_eq!(err.code(), "upstream_stream_error");
    }

    #[test]
    fn test_client_disconnect_is_silent() {
        assert!(!RelayError::ClientDisconnected.notifies_client());
        assert!(RelayError::ConfigInvalid("x".into()).notifies_client());
        assert!(RelayError::IdleTimeout.notifies_client());
    }
}
