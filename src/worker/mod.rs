//! Routing workers.
//!
//! A worker owns the resources a session needs thread-locally in spirit:
//! the backend connection pool and the user-cache view. A session is
//! bound to one worker for its whole life, and a worker's pool is never
//! touched on behalf of another worker's sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::WorkerPool;
use crate::config::PoolConfig;
use crate::users::{UserCache, UserManager};

pub struct Worker {
    id: usize,
    pub pool: WorkerPool,
    pub user_cache: UserCache,
}

impl Worker {
    pub fn new(id: usize, pool_config: PoolConfig, user_manager: Arc<UserManager>) -> Arc<Self> {
        Arc::new(Self {
            id,
            pool: WorkerPool::new(pool_config),
            user_cache: UserCache::new(user_manager),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

/// The fixed set of routing workers; sessions are dealt round-robin.
pub struct WorkerSet {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
}

impl WorkerSet {
    pub fn new(count: usize, pool_config: &PoolConfig, user_manager: &Arc<UserManager>) -> Self {
        let workers = (0..count.max(1))
            .map(|id| Worker::new(id, pool_config.clone(), user_manager.clone()))
            .collect();
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Bind the next session to a worker.
    pub fn pick(&self) -> Arc<Worker> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Periodic pool maintenance for every worker.
    pub fn evict_expired_connections(&self) {
        for worker in &self.workers {
            worker.pool.evict_expired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserManagerConfig;

    #[test]
    fn round_robin_assignment() {
        let manager = UserManager::new(
            UserManagerConfig::default(),
            "svc".into(),
            "pw".into(),
            vec![],
        );
        let set = WorkerSet::new(3, &PoolConfig::default(), &manager);
        assert_eq!(set.len(), 3);

        let ids: Vec<usize> = (0..6).map(|_| set.pick().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn zero_workers_clamped_to_one() {
        let manager = UserManager::new(
            UserManagerConfig::default(),
            "svc".into(),
            "pw".into(),
            vec![],
        );
        let set = WorkerSet::new(0, &PoolConfig::default(), &manager);
        assert_eq!(set.len(), 1);
    }
}
