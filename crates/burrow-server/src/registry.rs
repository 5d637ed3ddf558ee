use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::endpoint::normalize;
use crate::error::BrokerError;
use crate::session::Session;

/// Maps endpoint ids to their live sessions
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session under its endpoint id
    ///
    /// Fails with `DuplicateEndpoint` if the id is already taken. The check
    /// and insert happen under one shard lock, so of two concurrent
    /// registrations for the same id exactly one wins.
    pub fn register(&self, session: Arc<Session>) -> Result<(), BrokerError> {
        let endpoint_id = normalize(session.endpoint_id());
        match self.sessions.entry(endpoint_id) {
            Entry::Occupied(entry) => Err(BrokerError::DuplicateEndpoint(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::info!("Registered endpoint: {}", entry.key());
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Find the session for an endpoint id
    pub fn lookup(&self, endpoint_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(&normalize(endpoint_id))
            .map(|entry| entry.value().clone())
    }

    /// Remove an endpoint, whichever session holds it
    pub fn deregister(&self, endpoint_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&normalize(endpoint_id));
        if let Some((endpoint_id, _)) = &removed {
            tracing::info!("Unregistered endpoint: {}", endpoint_id);
        }
        removed.map(|(_, session)| session)
    }

    /// Remove the entry only if it still points at `session`
    ///
    /// Used on teardown so a session never removes a successor that
    /// registered the same id after it.
    pub fn deregister_session(&self, session: &Arc<Session>) -> bool {
        let endpoint_id = normalize(session.endpoint_id());
        let removed = self
            .sessions
            .remove_if(&endpoint_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            tracing::info!("Unregistered endpoint: {}", endpoint_id);
        }
        removed
    }

    /// Registered endpoint ids, sorted
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        endpoints.sort();
        endpoints
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and close every session
    pub fn shutdown(&self) -> usize {
        let endpoints: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        let mut closed = 0;
        for endpoint_id in endpoints {
            if let Some((_, session)) = self.sessions.remove(&endpoint_id) {
                session.close();
                closed += 1;
            }
        }
        closed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionSettings, SessionState};
    use tokio::sync::mpsc;

    fn session(endpoint_id: &str) -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(endpoint_id, tx, SessionSettings::default());
        session.activate();
        session
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        registry.register(session("abc123")).unwrap();

        assert!(registry.lookup("abc123").is_some());
        assert!(registry.lookup("ABC123").is_some());
        assert!(registry.lookup("other").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = SessionRegistry::new();
        let first = session("abc123");
        registry.register(first.clone()).unwrap();

        let err = registry.register(session("ABC123")).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateEndpoint(id) if id == "abc123"));

        // Original mapping survives
        let found = registry.lookup("abc123").unwrap();
        assert!(Arc::ptr_eq(&found, &first));
    }

    #[test]
    fn test_concurrent_registration_has_one_winner() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(session("race")).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_session_spares_successor() {
        let registry = SessionRegistry::new();
        let old = session("abc123");
        registry.register(old.clone()).unwrap();
        assert!(registry.deregister("abc123").is_some());

        let new = session("abc123");
        registry.register(new.clone()).unwrap();

        // Late teardown of the old session must not evict the new one
        assert!(!registry.deregister_session(&old));
        assert!(registry.lookup("abc123").is_some());

        assert!(registry.deregister_session(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_endpoints_sorted() {
        let registry = SessionRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            registry.register(session(id)).unwrap();
        }
        assert_eq!(registry.endpoints(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let registry = SessionRegistry::new();
        let a = session("a");
        let b = session("b");
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert_eq!(registry.shutdown(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
    }
}
