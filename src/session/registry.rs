//! Process-wide session registry.
//!
//! KILL resolves a target session here: which servers it has backend
//! connections on, and under which backend thread ids. The registry also
//! carries the kill signal a victim session observes at its next
//! suspension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Backend link of a registered session.
#[derive(Debug, Clone)]
pub struct BackendRef {
    pub server_name: String,
    pub server_addr: String,
    pub thread_id: u32,
}

#[derive(Debug, Default)]
pub struct SessionHandle {
    pub username: Mutex<String>,
    backends: Mutex<Vec<BackendRef>>,
    killed: AtomicBool,
    kill_signal: Notify,
}

impl SessionHandle {
    /// Record a live backend connection of this session. Re-registering
    /// the same link is a no-op.
    pub fn add_backend(&self, server_name: &str, server_addr: &str, thread_id: u32) {
        let mut backends = self.backends.lock();
        if backends
            .iter()
            .any(|b| b.server_name == server_name && b.thread_id == thread_id)
        {
            return;
        }
        backends.push(BackendRef {
            server_name: server_name.to_string(),
            server_addr: server_addr.to_string(),
            thread_id,
        });
    }

    pub fn remove_backend(&self, server_name: &str, thread_id: u32) {
        self.backends
            .lock()
            .retain(|b| !(b.server_name == server_name && b.thread_id == thread_id));
    }

    pub fn backends(&self) -> Vec<BackendRef> {
        self.backends.lock().clone()
    }

    /// Mark the session killed and wake it.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.kill_signal.notify_waiters();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Await the kill signal; used inside the session's select loop.
    pub async fn killed_signal(&self) {
        if self.is_killed() {
            return;
        }
        self.kill_signal.notified().await;
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session_id: u64, username: &str) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::default());
        *handle.username.lock() = username.to_string();
        self.sessions.insert(session_id, handle.clone());
        handle
    }

    pub fn deregister(&self, session_id: u64) {
        self.sessions.remove(&session_id);
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&session_id).map(|h| h.clone())
    }

    /// Sessions belonging to a username (KILL USER).
    pub fn sessions_of_user(&self, username: &str) -> Vec<(u64, Arc<SessionHandle>)> {
        self.sessions
            .iter()
            .filter(|entry| *entry.value().username.lock() == username)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let registry = SessionRegistry::new();
        let handle = registry.register(7, "alice");
        handle.add_backend("db1", "10.0.0.1:3306", 1234);

        let found = registry.get(7).unwrap();
        let backends = found.backends();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].thread_id, 1234);

        registry.deregister(7);
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn lookup_by_user() {
        let registry = SessionRegistry::new();
        registry.register(1, "alice");
        registry.register(2, "bob");
        registry.register(3, "alice");

        let alices = registry.sessions_of_user("alice");
        assert_eq!(alices.len(), 2);
    }

    #[tokio::test]
    async fn kill_signal_wakes_immediately_when_already_killed() {
        let handle = SessionHandle::default();
        handle.kill();
        // Must not hang.
        handle.killed_signal().await;
        assert!(handle.is_killed());
    }

    #[test]
    fn backend_removal() {
        let handle = SessionHandle::default();
        handle.add_backend("db1", "a:1", 10);
        handle.add_backend("db2", "b:1", 20);
        handle.remove_backend("db1", 10);
        let backends = handle.backends();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].server_name, "db2");
    }
}
