//! Per-worker backend connection pool.
//!
//! LIFO per (target, credentials) so hot connections stay warm. Only the
//! owning worker touches its pool; no cross-worker sharing. Idle and
//! max-age eviction happen lazily on take and put.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::PoolConfig;
use crate::target::Server;

use super::connection::BackendConnection;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    target: String,
    credentials: String,
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<PoolKey, Vec<BackendConnection>>,
    /// Live (pooled + checked out) connections per target opened through
    /// this worker; enforces the per-target capacity.
    live: HashMap<String, usize>,
}

pub struct WorkerPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    /// Signalled whenever a capacity slot frees up.
    slot_freed: Notify,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner::default()),
            slot_freed: Notify::new(),
        }
    }

    /// Take a pooled connection for (server, credentials), evicting dead
    /// wood on the way. LIFO: the most recently returned one comes back
    /// first.
    pub fn take(&self, server: &Server, credentials_key: &str) -> Option<BackendConnection> {
        let key = PoolKey {
            target: server.name().to_string(),
            credentials: credentials_key.to_string(),
        };
        let mut inner = self.inner.lock();
        let list = inner.idle.get_mut(&key)?;

        let mut found = None;
        let mut expired_conns = Vec::new();
        while let Some(conn) = list.pop() {
            if self.expired(&conn) {
                expired_conns.push(conn);
                continue;
            }
            found = Some(conn);
            break;
        }
        for conn in expired_conns {
            drop_connection(&mut inner, conn);
        }
        if found.is_some() {
            debug!(server = server.name(), "reusing pooled connection");
        }
        found
    }

    /// Return a connection to the pool. Refused (and the connection
    /// dropped) when it is not idle, past its lifetime, or the pool for
    /// its key is full.
    pub fn put(&self, conn: BackendConnection) {
        let mut inner = self.inner.lock();

        if !conn.idle() || self.expired(&conn) {
            drop_connection(&mut inner, conn);
            self.slot_freed.notify_waiters();
            return;
        }

        let key = PoolKey {
            target: conn.server().name().to_string(),
            credentials: conn.credentials_key().to_string(),
        };
        let list = inner.idle.entry(key).or_default();
        if list.len() >= self.config.max_pool_size {
            let conn = match list.len() {
                // Prefer dropping the oldest pooled entry over the fresh one.
                0 => conn,
                _ => std::mem::replace(&mut list[0], conn),
            };
            drop_connection(&mut inner, conn);
            self.slot_freed.notify_waiters();
            return;
        }
        list.push(conn);
    }

    /// Account for a connection that is about to be opened. Returns false
    /// when the target is at capacity (`max` of 0 means unlimited).
    pub fn reserve(&self, server: &Server, max: usize) -> bool {
        let mut inner = self.inner.lock();
        let count = inner.live.entry(server.name().to_string()).or_insert(0);
        if max > 0 && *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a capacity slot (connection closed or failed to open).
    pub fn release_slot(&self, server_name: &str) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.live.get_mut(server_name) {
            *count = count.saturating_sub(1);
        }
        drop(inner);
        self.slot_freed.notify_waiters();
    }

    /// Park until some slot frees. Spurious wakeups are fine; callers
    /// re-check capacity.
    pub async fn slot_available(&self) {
        self.slot_freed.notified().await;
    }

    /// Drop pooled connections that have idled or aged out.
    pub fn evict_expired(&self) {
        let mut inner = self.inner.lock();
        let keys: Vec<PoolKey> = inner.idle.keys().cloned().collect();
        for key in keys {
            let Some(mut list) = inner.idle.remove(&key) else {
                continue;
            };
            let mut kept = Vec::with_capacity(list.len());
            for conn in list.drain(..) {
                if self.expired(&conn) {
                    drop_connection(&mut inner, conn);
                } else {
                    kept.push(conn);
                }
            }
            if !kept.is_empty() {
                inner.idle.insert(key, kept);
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.values().map(Vec::len).sum()
    }

    fn expired(&self, conn: &BackendConnection) -> bool {
        conn.created_at().elapsed() > self.config.max_lifetime()
            || conn.last_used().elapsed() > self.config.idle_timeout()
    }
}

/// Drop a connection, keeping the live accounting straight. The socket
/// closes with the value; no COM_QUIT is owed to an evicted connection.
fn drop_connection(inner: &mut PoolInner, conn: BackendConnection) {
    if let Some(count) = inner.live.get_mut(conn.server().name()) {
        *count = count.saturating_sub(1);
    }
    conn.server().connection_closed();
}
