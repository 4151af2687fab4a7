//! Session Registry
//!
//! A session is the result of a completed handshake: an id both sides
//! agree on, the shared key seed, and the authenticated peer. Sessions
//! live in a process-wide registry until the tunnel using them closes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use drmchain_crypto::{KeySeed, PublicIdentity};
use tracing::debug;
use uuid::Uuid;

/// A remote node: who it is and where to reach it
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Authenticated identity
    pub identity: PublicIdentity,

    /// Handshake address before a session exists, stream address after
    pub addr: SocketAddr,
}

impl Peer {
    /// Create a peer
    pub fn new(identity: PublicIdentity, addr: SocketAddr) -> Self {
        Self { identity, addr }
    }

    /// The peer's tag
    pub fn tag(&self) -> String {
        self.identity.tag()
    }
}

/// An established handshake session
pub struct Session {
    /// Session identifier, shared by both endpoints
    pub id: String,

    /// Key seed both directions' sealers are derived from
    pub key_seed: KeySeed,

    /// The authenticated remote side
    pub peer: Peer,

    connected: Mutex<bool>,
}

impl Session {
    /// Create a session that has not been connected yet
    pub fn new(id: impl Into<String>, key_seed: KeySeed, peer: Peer) -> Self {
        Self {
            id: id.into(),
            key_seed,
            peer,
            connected: Mutex::new(false),
        }
    }

    /// Whether a tunnel has been bound to this session
    pub fn was_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically claim the session for a tunnel.
    ///
    /// Returns `false` if it was already connected.
    pub fn try_mark_connected(&self) -> bool {
        let mut connected = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        if *connected {
            return false;
        }
        *connected = true;
        true
    }

    /// Give back a claim whose tunnel never came up
    pub fn release(&self) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.was_connected())
            .finish()
    }
}

/// Concurrent map of session id to session
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a session under a fresh random id
    pub fn generate_session(&self, peer: Peer, key_seed: KeySeed) -> Arc<Session> {
        let session = Session::new(Uuid::new_v4().to_string(), key_seed, peer);
        self.register_session(session)
    }

    /// Store a session created elsewhere (initiator side).
    ///
    /// An existing entry with the same id is replaced.
    pub fn register_session(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        debug!("Registered session {} with {:?}", session.id, session.peer.identity);
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Look up a session by id
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Drop a session
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| {
            debug!("Removed session {}", id);
            session
        })
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmchain_crypto::NodeIdentity;

    fn test_peer() -> Peer {
        let identity = NodeIdentity::generate();
        Peer::new(identity.public_identity().clone(), "127.0.0.1:2504".parse().unwrap())
    }

    #[test]
    fn test_generate_and_get() {
        let registry = SessionRegistry::new();
        let seed = KeySeed::generate();
        let session = registry.generate_session(test_peer(), seed.clone());

        let found = registry.get_session(&session.id).expect("session should be registered");
        assert!(Arc::ptr_eq(&session, &found));
        assert_eq!(found.key_seed, seed);
        assert!(!found.was_connected());
        assert!(registry.get_session("missing").is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.generate_session(test_peer(), KeySeed::generate());
        let b = registry.generate_session(test_peer(), KeySeed::generate());

        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_replaces() {
        let registry = SessionRegistry::new();
        let peer = test_peer();
        registry.register_session(Session::new("s1", KeySeed::generate(), peer.clone()));
        let newer = registry.register_session(Session::new("s1", KeySeed::generate(), peer));

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get_session("s1").unwrap(), &newer));

        registry.remove_session("s1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_claim_once() {
        let session = Session::new("s1", KeySeed::generate(), test_peer());

        assert!(session.try_mark_connected());
        assert!(session.was_connected());
        assert!(!session.try_mark_connected());

        session.release();
        assert!(!session.was_connected());
        assert!(session.try_mark_connected());
    }
}
