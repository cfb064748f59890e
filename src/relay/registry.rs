//! # Session Registry
//!
//! Tracks every live relay session by identifier, for the status endpoints and
//! for forced shutdown when the process stops.
//!
//! ## Key Rust Concepts:
//! - **Interior mutability**: a `std::sync::RwLock` around the map so the
//!   registration guard can unregister from `Drop` without an async context
//! - **RAII**: [`Registration`] removes its entry exactly once, whether the
//!   session ends normally, fails, or its task unwinds
//!
//! ## Thread Safety:
//! The registry is shared as `Arc<SessionRegistry>`. Lock sections are short and
//! never held across an `.await`.

use crate::relay::session::{Session, SessionSnapshot, SessionState};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a session could not be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Another live session already uses this identifier
    DuplicateId(Uuid),
    AtCapacity(usize),
    ShuttingDown,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "session {} is already registered", id),
            RegistryError::AtCapacity(max) => {
                write!(f, "maximum concurrent sessions ({}) reached", max)
            }
            RegistryError::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Lifetime counters, exposed through the metrics endpoint.
#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    closed: AtomicU64,
    failed: AtomicU64,
    dropped_interim: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub closed_sessions: u64,
    pub failed_sessions: u64,
    pub dropped_interim_results: u64,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    max_sessions: AtomicUsize,
    shutting_down: AtomicBool,
    emptied: Notify,
    counters: Counters,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
            shutting_down: AtomicBool::new(false),
            emptied: Notify::new(),
            counters: Counters::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a session. The returned guard unregisters it when released or dropped.
    pub fn register(self: &Arc<Self>, session: Arc<Session>) -> Result<Registration, RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }

        let mut sessions = self.write();
        // Checked again under the lock: `shutdown_all` sets the flag while holding it.
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }
        if sessions.contains_key(&session.id) {
            return Err(RegistryError::DuplicateId(session.id));
        }
        let max = self.max_sessions.load(Ordering::Relaxed);
        if sessions.len() >= max {
            return Err(RegistryError::AtCapacity(max));
        }

        let id = session.id;
        sessions.insert(id, session.clone());
        let active = sessions.len();
        drop(sessions);

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, active, "session registered");

        Ok(Registration { registry: self.clone(), session, released: false })
    }

    /// Remove a session and count its outcome. Returns `None` if it was not registered.
    pub fn unregister(&self, id: Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.write();
        let removed = sessions.remove(&id);
        let now_empty = sessions.is_empty();
        drop(sessions);

        if let Some(session) = removed.as_ref() {
            match session.state() {
                SessionState::Failed => self.counters.failed.fetch_add(1, Ordering::Relaxed),
                _ => self.counters.closed.fetch_add(1, Ordering::Relaxed),
            };
            debug!(session_id = %id, state = %session.state(), "session unregistered");
        }
        if now_empty {
            self.emptied.notify_waiters();
        }
        removed
    }

    pub fn find(&self, id: Uuid) -> Option<Arc<Session>> {
        self.read().get(&id).cloned()
    }

    /// Visit every live session. The callback runs on a copy of the entry list,
    /// so it may register or unregister without deadlocking.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<Session>),
    {
        let sessions: Vec<Arc<Session>> = self.read().values().cloned().collect();
        for session in &sessions {
            visit(session);
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.read().values().map(|session| session.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        snapshots
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::Relaxed);
    }

    pub fn record_dropped_interim(&self, count: u64) {
        if count > 0 {
            self.counters.dropped_interim.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.len(),
            total_sessions: self.counters.registered.load(Ordering::Relaxed),
            closed_sessions: self.counters.closed.load(Ordering::Relaxed),
            failed_sessions: self.counters.failed.load(Ordering::Relaxed),
            dropped_interim_results: self.counters.dropped_interim.load(Ordering::Relaxed),
        }
    }

    /// Force every session closed and wait for them to unregister.
    ///
    /// New registrations are refused from here on. Returns the number of sessions
    /// still registered when `timeout` expired (0 on a clean shutdown).
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        {
            let _sessions = self.write();
            self.shutting_down.store(true, Ordering::SeqCst);
        }

        let mut signalled = 0;
        self.for_each(|session| {
            session.request_shutdown();
            signalled += 1;
        });
        info!(sessions = signalled, "shutting down relay sessions");

        let drained = async {
            loop {
                let emptied = self.emptied.notified();
                if self.is_empty() {
                    break;
                }
                emptied.await;
            }
        };

        if tokio::time::timeout(timeout, drained).await.is_err() {
            let remaining = self.len();
            warn!(remaining, timeout_ms = timeout.as_millis() as u64, "sessions still open after shutdown timeout");
            return remaining;
        }
        0
    }
}

/// Registry entry owned by one session.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    released: bool,
}

impl Registration {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Remove the entry. Returns `false` if it was already removed.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.registry.unregister(self.session.id);
        true
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(max))
    }

    #[test]
    fn test_register_find_unregister() {
        let registry = registry(4);
        let session = Arc::new(Session::new(Uuid::new_v4()));
        let mut registration = registry.register(session.clone()).unwrap();

        assert_eq!(registry.find(session.id).map(|s| s.id), Some(session.id));
        assert!(registration.release());
        assert!(!registration.release());
        assert!(registry.find(session.id).is_none());
        assert_eq!(registry.stats().closed_sessions, 1);
    }

    #[test]
    fn test_live_id_cannot_be_aliased() {
        let registry = registry(4);
        let id = Uuid::new_v4();
        let first = registry.register(Arc::new(Session::new(id))).unwrap();

        let err = registry.register(Arc::new(Session::new(id))).err();
        assert_eq!(err, Some(RegistryError::DuplicateId(id)));

        // Reuse is fine once the first session is gone.
        drop(first);
        assert!(registry.register(Arc::new(Session::new(id))).is_ok());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = registry(1);
        let _held = registry.register(Arc::new(Session::new(Uuid::new_v4()))).unwrap();
        let err = registry.register(Arc::new(Session::new(Uuid::new_v4()))).err();
        assert_eq!(err, Some(RegistryError::AtCapacity(1)));
    }

    #[test]
    fn test_failed_sessions_are_counted() {
        let registry = registry(4);
        let session = Arc::new(Session::new(Uuid::new_v4()));
        let registration = registry.register(session.clone()).unwrap();
        session.transition(SessionState::Failed).unwrap();
        drop(registration);

        let stats = registry.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.failed_sessions, 1);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_waits_for_sessions() {
        let registry = registry(4);
        let session = Arc::new(Session::new(Uuid::new_v4()));
        let registration = registry.register(session.clone()).unwrap();

        let token = session.shutdown_token();
        let worker = tokio::spawn(async move {
            token.cancelled().await;
            drop(registration);
        });

        let remaining = registry.shutdown_all(Duration::from_secs(1)).await;
        assert_eq!(remaining, 0);
        worker.await.unwrap();

        let err = registry.register(Arc::new(Session::new(Uuid::new_v4()))).err();
        assert_eq!(err, Some(RegistryError::ShuttingDown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_racing_shutdown_is_still_cancelled() {
        let registry = registry(1_000_000);
        let racer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                loop {
                    let session = Arc::new(Session::new(Uuid::new_v4()));
                    match registry.register(session.clone()) {
                        Ok(registration) => {
                            let token = session.shutdown_token();
                            tokio::spawn(async move {
                                token.cancelled().await;
                                drop(registration);
                            });
                        }
                        Err(RegistryError::ShuttingDown) => break,
                        Err(other) => panic!("unexpected registry error: {}", other),
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        let remaining = registry.shutdown_all(Duration::from_secs(5)).await;
        racer.await.unwrap();

        assert_eq!(remaining, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_gives_up_after_timeout() {
        let registry = registry(4);
        let _stuck = registry.register(Arc::new(Session::new(Uuid::new_v4()))).unwrap();

        let remaining = registry.shutdown_all(Duration::from_millis(500)).await;
        assert_eq!(remaining, 1);
    }
}
