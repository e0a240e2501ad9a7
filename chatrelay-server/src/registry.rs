//! Session Registry
//!
//! Maps each online identity to its [`Session`]. This is the single source of
//! truth for "who is online": the lifecycle code inserts on a successful join
//! and removes on teardown, the router reads it for every routing decision.
//!
//! Every mutation and every snapshot goes through one lock, so a broadcast
//! never sees a half-removed entry and never misses a session whose
//! registration finished before the snapshot was taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use chatrelay_protocol::Identity;

use crate::session::{Session, SessionId};

/// Registry mutation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("identity already in use: {0}")]
    DuplicateIdentity(Identity),

    #[error("registry is closed for shutdown")]
    Closed,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Identity, Arc<Session>>,
    /// Set once by shutdown; no registrations afterwards
    closed: bool,
}

/// Registry tracking all joined sessions
///
/// Thread-safe for concurrent access from every connection task.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    /// Counter for generating unique session IDs
    next_session_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a session about to be created
    pub fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_session_id.fetch_add(1, Ordering::SeqCst))
    }

    // ==================== Mutation ====================

    /// Register a session under its identity
    ///
    /// Fails without touching the registry if the identity is taken or the
    /// relay is shutting down.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();

        if inner.closed {
            return Err(RegistryError::Closed);
        }

        let identity = session.identity().to_string();
        if inner.sessions.contains_key(&identity) {
            return Err(RegistryError::DuplicateIdentity(identity));
        }

        debug!("Registered {} as {}", session.id(), identity);
        inner.sessions.insert(identity, session);
        Ok(())
    }

    /// Remove whatever session is registered under `identity`
    ///
    /// No-op if absent.
    pub fn unregister(&self, identity: &str) -> Option<Arc<Session>> {
        let removed = self.inner.write().sessions.remove(identity);
        if let Some(session) = &removed {
            debug!("Unregistered {} ({})", session.id(), identity);
        }
        removed
    }

    /// Remove `session` only if its identity still maps to it
    ///
    /// A late teardown of a departed session must not evict a newer session
    /// that reused the identity. Returns true if an entry was removed.
    pub fn unregister_session(&self, session: &Session) -> bool {
        let mut inner = self.inner.write();

        let matches = inner
            .sessions
            .get(session.identity())
            .is_some_and(|current| current.id() == session.id());

        if matches {
            inner.sessions.remove(session.identity());
            debug!("Unregistered {} ({})", session.id(), session.identity());
        }
        matches
    }

    /// Refuse further registrations and hand back every registered session
    ///
    /// Used once by shutdown. Later calls return an empty list.
    pub fn close(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.sessions.drain().map(|(_, session)| session).collect()
    }

    // ==================== Queries ====================

    /// Find the session registered under `identity`
    pub fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(identity).cloned()
    }

    /// Consistent point-in-time copy of every entry
    ///
    /// Iteration order is unspecified.
    pub fn snapshot_all(&self) -> Vec<(Identity, Arc<Session>)> {
        self.inner
            .read()
            .sessions
            .iter()
            .map(|(identity, session)| (identity.clone(), Arc::clone(session)))
            .collect()
    }

    /// Sorted list of online identities
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self.inner.read().sessions.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("session_count", &self.len())
            .finish()
    }
}
