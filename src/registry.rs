use std::{
    collections::HashMap,
    fmt,
    sync::{PoisonError, RwLock},
};

use crate::test_id::TestId;

/// Opaque token the proxy hands out when a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps each test to the session it is currently recording or playing back.
///
/// Shared by `Arc` between the session client and anything else that needs to
/// find a test's session (sanitizers, for instance). Entries are overwritten
/// when a test id is reused and are never removed, so tests running side by
/// side must use distinct ids.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<TestId, SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, test_id: TestId, session_id: SessionId) -> Option<SessionId> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(test_id, session_id)
    }

    pub fn get(&self, test_id: &TestId) -> Option<SessionId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(test_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::{SessionId, SessionRegistry};
    use crate::test_id::TestId;

    #[test]
    fn set_overwrites_previous_session() {
        let registry = SessionRegistry::new();
        let test_id = TestId::new("tests/a.rs", "a::first");

        assert!(registry.get(&test_id).is_none());
        assert_eq!(registry.set(test_id.clone(), SessionId::new("one")), None);
        assert_eq!(
            registry.set(test_id.clone(), SessionId::new("two")),
            Some(SessionId::new("one"))
        );
        assert_eq!(registry.get(&test_id), Some(SessionId::new("two")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_tests_do_not_interfere() {
        let registry = Arc::new(SessionRegistry::new());
        let handles = (0..8)
            .map(|idx| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let test_id = TestId::new("tests/par.rs", &format!("par::case_{idx}"));
                    registry.set(test_id.clone(), SessionId::new(format!("session-{idx}")));
                    registry.get(&test_id)
                })
            })
            .collect::<Vec<_>>();

        for (idx, handle) in handles.into_iter().enumerate() {
            assert_eq!(
                handle.join().unwrap(),
                Some(SessionId::new(format!("session-{idx}")))
            );
        }
        assert_eq!(registry.len(), 8);
    }
}
