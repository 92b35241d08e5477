//! Per-worker view of the user database.
//!
//! Each worker holds its own pointer to the published snapshot and only
//! refreshes it between lookups, so one lookup always sees a single
//! self-consistent database.

use std::sync::Arc;

use parking_lot::Mutex;

use super::database::{ResolvedHostname, UserDatabase};
use super::lookup::{find_user, UserSearchResult, UserSearchSettings};
use super::manager::UserManager;

pub struct UserCache {
    manager: Arc<UserManager>,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    db: Arc<UserDatabase>,
    version: i64,
}

impl UserCache {
    pub fn new(manager: Arc<UserManager>) -> Self {
        let db = manager.snapshot();
        let version = manager.version();
        Self {
            manager,
            inner: Mutex::new(CacheInner { db, version }),
        }
    }

    /// Copy the manager's snapshot if it has advanced.
    pub fn update_from_manager(&self) {
        let mut inner = self.inner.lock();
        let latest = self.manager.version();
        if inner.version < latest {
            inner.db = self.manager.snapshot();
            inner.version = latest;
        }
    }

    pub fn version(&self) -> i64 {
        self.inner.lock().version
    }

    /// True when a session's refresh request would produce fresh data
    /// soon: either the manager is ahead of this cache already, or the
    /// throttle has expired.
    pub fn can_update_immediately(&self) -> bool {
        self.version() < self.manager.version() || self.manager.can_update_immediately()
    }

    pub fn request_refresh(&self) {
        self.manager.request_refresh();
    }

    /// Watch the manager's version counter.
    pub fn subscribe_version(&self) -> tokio::sync::watch::Receiver<i64> {
        self.manager.subscribe_version()
    }

    /// Run the account search against the current snapshot.
    pub fn find_user(
        &self,
        user: &str,
        addr: &str,
        requested_db: &str,
        settings: &UserSearchSettings,
        hostname: &ResolvedHostname,
    ) -> UserSearchResult {
        let db = self.inner.lock().db.clone();
        find_user(&db, user, addr, requested_db, settings, hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserManagerConfig;

    #[test]
    fn cache_tracks_manager_version() {
        let manager = UserManager::new(
            UserManagerConfig::default(),
            "svc".into(),
            "pw".into(),
            vec![],
        );
        let cache = UserCache::new(manager.clone());
        assert_eq!(cache.version(), 0);

        cache.update_from_manager();
        assert_eq!(cache.version(), manager.version());
    }
}
