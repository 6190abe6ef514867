// The relay's table of live sessions.
//
// Every accepted connection is inserted on accept; registration later gives
// it an identity. All state sits behind one mutex: the session map plus a
// name index keyed by the case-folded identity. Uniqueness check and insert
// into the index happen in the same critical section, so two concurrent
// registrations for "Alice" and "alice" cannot both win.
//
// Callers never see the map itself. Reads return owned snapshots
// (`Vec<Arc<Session>>`), which stay valid while other threads keep mutating
// the registry. Unnamed sessions are excluded from every name-based view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RegisterError;
use crate::session::{Session, SessionId};

/// Case-insensitive key for an identity.
fn fold(identity: &str) -> String {
    identity.trim().to_lowercase()
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    names: HashMap<String, SessionId>,
}

/// Shared session table. One per relay.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly accepted (still unnamed) session.
    pub fn insert(&self, session: Arc<Session>) {
        self.lock().sessions.insert(session.id(), session);
    }

    /// Give `id` the identity `identity` (trimmed) if no other session holds
    /// it, ignoring case. Returns the identity as stored.
    pub fn try_register(&self, id: SessionId, identity: &str) -> Result<String, RegisterError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(RegisterError::NameRequired);
        }
        let key = fold(identity);

        let mut inner = self.lock();
        let session = inner
            .sessions
            .get(&id)
            .cloned()
            .ok_or(RegisterError::UnknownSession)?;
        if session.is_named() {
            return Err(RegisterError::AlreadyRegistered);
        }
        if inner.names.contains_key(&key) {
            return Err(RegisterError::NameTaken);
        }
        if !session.set_identity(identity.to_string()) {
            return Err(RegisterError::AlreadyRegistered);
        }
        inner.names.insert(key, id);
        Ok(identity.to_string())
    }

    /// Drop `id` from the table. No-op (returns `None`) if already gone.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let session = inner.sessions.remove(&id)?;
        if let Some(identity) = session.identity() {
            let key = fold(identity);
            if inner.names.get(&key) == Some(&id) {
                inner.names.remove(&key);
            }
        }
        Some(session)
    }

    /// The named session holding `identity`, ignoring case.
    pub fn find_by_name(&self, identity: &str) -> Option<Arc<Session>> {
        let inner = self.lock();
        let id = inner.names.get(&fold(identity))?;
        inner.sessions.get(id).cloned()
    }

    pub fn is_name_taken(&self, identity: &str) -> bool {
        self.lock().names.contains_key(&fold(identity))
    }

    /// Point-in-time copy of all named sessions, ordered by identity
    /// (case-insensitive).
    pub fn named_sessions(&self) -> Vec<Arc<Session>> {
        let inner = self.lock();
        let mut named: Vec<(String, Arc<Session>)> = inner
            .names
            .iter()
            .filter_map(|(key, id)| Some((key.clone(), inner.sessions.get(id)?.clone())))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named.into_iter().map(|(_, session)| session).collect()
    }

    /// Identities of all named sessions, in `named_sessions` order.
    pub fn identities(&self) -> Vec<String> {
        self.named_sessions()
            .iter()
            .filter_map(|s| s.identity().map(String::from))
            .collect()
    }

    /// Every tracked session, named or not. Used by the shutdown sweep.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    pub fn named_count(&self) -> usize {
        self.lock().names.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpStream;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::session::test_support::session_pair;

    fn registry_with(count: usize) -> (Registry, Vec<Arc<Session>>, Vec<BufReader<TcpStream>>) {
        let registry = Registry::new();
        let mut sessions = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..count {
            let (session, client) = session_pair();
            registry.insert(session.clone());
            sessions.push(session);
            clients.push(client);
        }
        (registry, sessions, clients)
    }

    #[test]
    fn register_then_lookup_ignores_case() {
        let (registry, sessions, _clients) = registry_with(1);
        let stored = registry.try_register(sessions[0].id(), "  Alice ").unwrap();
        assert_eq!(stored, "Alice");
        assert!(registry.is_name_taken("alice"));
        assert!(registry.is_name_taken("ALICE"));
        let found = registry.find_by_name("aLiCe").unwrap();
        assert_eq!(found.id(), sessions[0].id());
    }

    #[test]
    fn second_registration_of_same_name_is_rejected() {
        let (registry, sessions, _clients) = registry_with(2);
        registry.try_register(sessions[0].id(), "alice").unwrap();
        assert_eq!(
            registry.try_register(sessions[1].id(), "Alice"),
            Err(RegisterError::NameTaken)
        );
        assert!(!sessions[1].is_named());
        assert_eq!(registry.named_count(), 1);
    }

    #[test]
    fn empty_identity_is_rejected() {
        let (registry, sessions, _clients) = registry_with(1);
        assert_eq!(
            registry.try_register(sessions[0].id(), "   "),
            Err(RegisterError::NameRequired)
        );
    }

    #[test]
    fn identity_cannot_change() {
        let (registry, sessions, _clients) = registry_with(1);
        registry.try_register(sessions[0].id(), "alice").unwrap();
        assert_eq!(
            registry.try_register(sessions[0].id(), "bob"),
            Err(RegisterError::AlreadyRegistered)
        );
        assert!(!registry.is_name_taken("bob"));
    }

    #[test]
    fn unknown_session_cannot_register() {
        let registry = Registry::new();
        assert_eq!(
            registry.try_register(SessionId::new(), "alice"),
            Err(RegisterError::UnknownSession)
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let (registry, sessions, _clients) = registry_with(2);
        registry.try_register(sessions[0].id(), "alice").unwrap();

        assert!(registry.remove(sessions[0].id()).is_some());
        assert!(registry.remove(sessions[0].id()).is_none());
        assert!(registry.remove(SessionId::new()).is_none());

        assert_eq!(registry.len(), 1);
        assert!(!registry.is_name_taken("alice"));
        assert!(registry.identities().is_empty());
    }

    #[test]
    fn name_is_free_again_after_remove() {
        let (registry, sessions, _clients) = registry_with(2);
        registry.try_register(sessions[0].id(), "alice").unwrap();
        registry.remove(sessions[0].id());
        assert_eq!(
            registry.try_register(sessions[1].id(), "ALICE").unwrap(),
            "ALICE"
        );
    }

    #[test]
    fn named_snapshot_excludes_unnamed_and_is_sorted() {
        let (registry, sessions, _clients) = registry_with(3);
        registry.try_register(sessions[0].id(), "carol").unwrap();
        registry.try_register(sessions[2].id(), "Bob").unwrap();

        let snapshot = registry.named_sessions();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.identities(), vec!["Bob", "carol"]);

        // The snapshot survives later mutation.
        registry.remove(sessions[0].id());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.identities(), vec!["Bob"]);
        assert_eq!(registry.all_sessions().len(), 2);
    }

    #[test]
    fn concurrent_registration_has_exactly_one_winner() {
        const CONTENDERS: usize = 8;
        let (registry, sessions, _clients) = registry_with(CONTENDERS);
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(CONTENDERS));

        let handles: Vec<_> = sessions
            .iter()
            .enumerate()
            .map(|(i, session)| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                let id = session.id();
                // Mix the case so folding is exercised under contention.
                let name = if i % 2 == 0 { "alice" } else { "ALICE" };
                thread::spawn(move || {
                    barrier.wait();
                    registry.try_register(id, name)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let taken = results
            .iter()
            .filter(|r| **r == Err(RegisterError::NameTaken))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(taken, CONTENDERS - 1);
        assert_eq!(registry.named_count(), 1);
        assert_eq!(sessions.iter().filter(|s| s.is_named()).count(), 1);
    }
}
