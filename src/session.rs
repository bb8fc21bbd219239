//! Browser session records.
//!
//! One record per cookie-identified browser: the flash-message queue
//! consumed by the UI and the set of endpoints the session is connected to,
//! used to release controller references on logout.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct Session {
    messages: Mutex<Vec<String>>,
    endpoints: Mutex<HashSet<String>>,
}

impl Session {
    pub fn push_message(&self, message: impl Into<String>) {
        self.messages
            .lock()
            .expect("session lock poisoned")
            .push(message.into());
    }

    /// Pending messages, cleared on read.
    pub fn drain_messages(&self) -> Vec<String> {
        std::mem::take(&mut self.messages.lock().expect("session lock poisoned"))
    }

    pub fn add_endpoint(&self, endpoint: impl Into<String>) {
        self.endpoints
            .lock()
            .expect("session lock poisoned")
            .insert(endpoint.into());
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .lock()
            .expect("session lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn connected(&self) -> bool {
        !self.endpoints.lock().expect("session lock poisoned").is_empty()
    }
}

/// All live browser sessions, keyed by cookie id.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Create a session under a fresh id.
    pub fn create(&self) -> (String, Arc<Session>) {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::default());
        self.sessions.insert(id.clone(), session.clone());
        (id, session)
    }

    pub fn get_or_create(&self, session_id: Option<&str>) -> (String, Arc<Session>) {
        if let Some(id) = session_id
            && let Some(session) = self.get(id)
        {
            return (id.to_string(), session);
        }
        self.create()
    }

    pub fn delete(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_drain_once() {
        let session = Session::default();
        session.push_message("added a new watcher");
        session.push_message("status switched");
        assert_eq!(session.drain_messages().len(), 2);
        assert!(session.drain_messages().is_empty());
    }

    #[test]
    fn test_get_or_create_reuses_known_ids() {
        let manager = SessionManager::new();
        let (id, session) = manager.create();
        session.add_endpoint("tcp://127.0.0.1:5555");

        let (same_id, same) = manager.get_or_create(Some(&id));
        assert_eq!(same_id, id);
        assert!(same.connected());

        let (fresh_id, fresh) = manager.get_or_create(Some("unknown"));
        assert_ne!(fresh_id, "unknown");
        assert!(!fresh.connected());
    }
}
