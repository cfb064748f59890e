//! Guaranteed release of everything a session holds.
//!
//! [`SessionResources`] owns the client handle, the upstream handle (once one is
//! open) and the registry entry. [`SessionResources::release`] performs the
//! orderly shutdown exactly once; if it never runs, `Drop` on each resource
//! still closes the socket, closes the upstream and unregisters the session.

use crate::relay::client::{ClientClose, ClientHandle};
use crate::relay::error::RelayError;
use crate::relay::event::{TranscriptEvent, CLOSE_SERVER_SHUTDOWN};
use crate::relay::registry::{Registration, SessionRegistry};
use crate::relay::session::{Session, SessionState};
use crate::relay::upstream::UpstreamHandle;
use std::sync::Arc;
use tracing::{info, warn};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Orderly end; the client gets a `close` event with this reason
    Completed(&'static str),
    /// Ended by an error; reported to the client unless the client itself
    /// went away (`RelayError::ClientDisconnected`)
    Failed(RelayError),
}

impl SessionEnd {
    pub fn final_state(&self) -> SessionState {
        match self {
            SessionEnd::Completed(_) => SessionState::Closed,
            SessionEnd::Failed(err) if !err.notifies_client() => SessionState::Closed,
            SessionEnd::Failed(_) => SessionState::Failed,
        }
    }
}

pub struct SessionResources {
    registration: Registration,
    client: ClientHandle,
    upstream: Option<UpstreamHandle>,
    released: bool,
}

impl SessionResources {
    pub fn new(registration: Registration, client: ClientHandle) -> Self {
        Self { registration, client, upstream: None, released: false }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.registration.session()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.registration.registry()
    }

    pub fn attach_upstream(&mut self, upstream: UpstreamHandle) {
        self.upstream = Some(upstream);
    }

    /// Both ends, for the relay loop. `None` until an upstream is attached.
    pub fn ends(&mut self) -> Option<(&mut UpstreamHandle, &mut ClientHandle)> {
        let client = &mut self.client;
        self.upstream.as_mut().map(|upstream| (upstream, client))
    }

    /// Close both ends, notify the client and unregister, in that order.
    ///
    /// Safe to call more than once; later calls only report the final state.
    pub async fn release(&mut self, end: &SessionEnd) -> SessionState {
        let session = self.registration.session().clone();
        if self.released {
            return session.state();
        }
        self.released = true;

        let state = session.state();
        let straight_to_failed = state == SessionState::AwaitingConfig
            && end.final_state() == SessionState::Failed;
        if !straight_to_failed && state != SessionState::Closing {
            let _ = session.transition(SessionState::Closing);
        }

        if let Some(upstream) = self.upstream.as_mut() {
            upstream.close().await;
        }

        match end {
            SessionEnd::Completed(reason) => {
                let _ = self.client.send(&TranscriptEvent::close(reason)).await;
                let how = if *reason == CLOSE_SERVER_SHUTDOWN {
                    ClientClose::Shutdown
                } else {
                    ClientClose::Normal
                };
                self.client.close(how);
            }
            SessionEnd::Failed(err) if err.notifies_client() => {
                let _ = self.client.send(&TranscriptEvent::error(err)).await;
                self.client.close(ClientClose::Error);
            }
            SessionEnd::Failed(_) => {
                self.client.mark_gone();
                self.client.close(ClientClose::Normal);
            }
        }

        let final_state = end.final_state();
        if let Err(err) = session.transition(final_state) {
            warn!(error = %err, "unexpected state during teardown");
        }
        match end {
            SessionEnd::Failed(err) if final_state == SessionState::Failed => {
                warn!(code = err.code(), error = %err, "session failed");
            }
            SessionEnd::Failed(_) => info!("client disconnected, session closed"),
            SessionEnd::Completed(_) => info!("session closed"),
        }

        self.registration.release();
        session.state()
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Fields drop after this and release the socket, upstream and entry.
        let session = self.registration.session();
        if !session.state().is_terminal() {
            let _ = session.transition(SessionState::Failed);
            warn!(session_id = %session.id, "session dropped without orderly teardown");
        }
    }
}
