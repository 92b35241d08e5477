//! Read/write-split backend selection.
//!
//! The terminal router of a session: writes go to the current master,
//! reads are balanced over replicas that pass the lag, rank and GTID
//! gates. Selection is a pure function of the candidate statistics, so
//! two decisions over the same candidates always agree.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::auth::BackendCredentials;
use crate::backend::{
    BackendError, ConnectOutcome, Endpoint, EndpointState, ReplyShape, WorkerPool,
};
use crate::config::{CausalReads, MasterFailureMode, RouterConfig, SelectionCriteria};
use crate::target::{Server, RLAG_UNDEFINED};

/// Where the router decided to send a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// The master endpoint (index into the router's endpoints).
    Master(usize),
    /// A replica endpoint.
    Slave(usize),
}

/// Write routing failed: no usable master.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct WriteRouteError {
    /// Close the session (true) or answer with an ERR and continue.
    pub fatal: bool,
    pub message: String,
}

pub struct RwSplitSession {
    config: RouterConfig,
    endpoints: Vec<Endpoint>,
    /// Index of the current master endpoint.
    master: Option<usize>,
    /// Rank this session pinned to on its first selection.
    session_rank: Option<i64>,
    /// GTID watermark per replication domain for causal reads.
    watermark: HashMap<u32, u64>,
}

impl RwSplitSession {
    pub fn new(servers: Vec<Arc<Server>>, config: RouterConfig) -> Self {
        let endpoints = servers
            .into_iter()
            .map(|server| {
                let max = server.max_connections();
                Endpoint::new(server, max)
            })
            .collect();
        Self {
            config,
            endpoints,
            master: None,
            session_rank: None,
            watermark: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut [Endpoint] {
        &mut self.endpoints
    }

    pub fn endpoint(&mut self, index: usize) -> &mut Endpoint {
        &mut self.endpoints[index]
    }

    pub fn master_index(&self) -> Option<usize> {
        self.master
    }

    /// Endpoints with a live or pending connection.
    pub fn connected_indexes(&self) -> Vec<usize> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, ep)| ep.in_use())
            .map(|(i, _)| i)
            .collect()
    }

    /// Open the session's initial connections. With `lazy_connect` only
    /// bookkeeping happens; otherwise the master plus replicas up to the
    /// budget are opened eagerly in least-global-connections order.
    pub async fn start(
        &mut self,
        pool: &WorkerPool,
        credentials: &BackendCredentials,
        database: Option<&str>,
        history: &[(u32, Bytes, ReplyShape)],
    ) -> Result<(), BackendError> {
        self.master = self.locate_master();

        if self.config.lazy_connect {
            return Ok(());
        }

        if let Some(master) = self.master {
            self.open_endpoint(master, pool, credentials, database, history)
                .await?;
        }

        // Replicas ordered by fewest global connections.
        let mut replicas: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| Some(i) != self.master)
            .filter(|&i| {
                let s = self.endpoints[i].server();
                s.is_slave() || s.is_relay()
            })
            .collect();
        replicas.sort_by_key(|&i| {
            self.endpoints[i]
                .server()
                .stats
                .n_current_conns
                .load(std::sync::atomic::Ordering::Relaxed)
        });

        for index in replicas.into_iter().take(self.config.max_slave_connections) {
            if let Err(e) = self
                .open_endpoint(index, pool, credentials, database, history)
                .await
            {
                // Eager opens are best-effort; the read path retries.
                debug!(
                    server = self.endpoints[index].server().name(),
                    error = %e,
                    "eager replica connect failed"
                );
            }
        }

        Ok(())
    }

    fn locate_master(&self) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|ep| ep.server().is_master())
    }

    async fn open_endpoint(
        &mut self,
        index: usize,
        pool: &WorkerPool,
        credentials: &BackendCredentials,
        database: Option<&str>,
        history: &[(u32, Bytes, ReplyShape)],
    ) -> Result<ConnectOutcome, BackendError> {
        let outcome = self.endpoints[index]
            .connect(pool, credentials, database, history)
            .await?;
        if let ConnectOutcome::Connected(_) = outcome {
            self.endpoints[index]
                .server()
                .stats
                .n_router_conns
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Pick the target for a write. Reconnects the master when allowed,
    /// otherwise reports failure according to the failure mode.
    pub async fn route_write(
        &mut self,
        pool: &WorkerPool,
        credentials: &BackendCredentials,
        database: Option<&str>,
        history: &[(u32, Bytes, ReplyShape)],
        can_recover: bool,
    ) -> Result<RouteDecision, WriteRouteError> {
        // The status may have moved since the last statement.
        if self
            .master
            .map(|m| !self.endpoints[m].server().is_master())
            .unwrap_or(true)
        {
            self.master = self.locate_master();
        }

        let Some(master) = self.master else {
            return Err(self.no_master_error());
        };

        if !self.endpoints[master].in_use() {
            let may_connect = self.endpoints[master].state() == EndpointState::NoConn
                || self.endpoints[master].state() == EndpointState::IdlePooled
                || self.config.master_reconnection;
            if !may_connect || !can_recover {
                return Err(self.no_master_error());
            }
            match self
                .open_endpoint(master, pool, credentials, database, history)
                .await
            {
                Ok(_) => {
                    info!(
                        server = self.endpoints[master].server().name(),
                        "connected to primary"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "primary connect failed");
                    return Err(self.no_master_error());
                }
            }
        }

        self.pin_rank(master);
        self.endpoints[master].server().note_write();
        Ok(RouteDecision::Master(master))
    }

    fn no_master_error(&self) -> WriteRouteError {
        let fatal = match self.config.master_failure_mode {
            MasterFailureMode::FailInstantly => true,
            MasterFailureMode::FailOnWrite => true,
            MasterFailureMode::ErrorOnWrite => false,
        };
        WriteRouteError {
            fatal,
            message: "Could not route write: no usable primary server".to_string(),
        }
    }

    /// Pick the target for a read, opening a replica connection lazily
    /// when the budget permits. Falls back to the master when no replica
    /// qualifies.
    pub async fn route_read(
        &mut self,
        pool: &WorkerPool,
        credentials: &BackendCredentials,
        database: Option<&str>,
        history: &[(u32, Bytes, ReplyShape)],
    ) -> Result<RouteDecision, WriteRouteError> {
        let candidates = self.read_candidates();
        let Some(index) = self.select_best(&candidates) else {
            // No replica qualifies; a readable master is the fallback.
            return self
                .route_write(pool, credentials, database, history, true)
                .await;
        };

        if !self.endpoints[index].in_use() {
            if let Err(e) = self
                .open_endpoint(index, pool, credentials, database, history)
                .await
            {
                warn!(
                    server = self.endpoints[index].server().name(),
                    error = %e,
                    "replica connect failed, retrying selection"
                );
                // One retry over the remaining candidates.
                let remaining: Vec<usize> =
                    candidates.into_iter().filter(|&i| i != index).collect();
                if let Some(second) = self.select_best(&remaining) {
                    if !self.endpoints[second].in_use() {
                        self.open_endpoint(second, pool, credentials, database, history)
                            .await
                            .map_err(|e| WriteRouteError {
                                fatal: false,
                                message: format!("no replica reachable: {e}"),
                            })?;
                    }
                    self.pin_rank(second);
                    return Ok(RouteDecision::Slave(second));
                }
                return self
                    .route_write(pool, credentials, database, history, true)
                    .await;
            }
        }

        self.pin_rank(index);
        if Some(index) == self.master {
            Ok(RouteDecision::Master(index))
        } else {
            Ok(RouteDecision::Slave(index))
        }
    }

    fn pin_rank(&mut self, index: usize) {
        if self.session_rank.is_none() {
            self.session_rank = Some(self.endpoints[index].server().rank());
        }
    }

    /// Gather read candidates per the policy gates: role, maintenance,
    /// rank, replication lag, GTID watermark and the replica budget.
    fn read_candidates(&self) -> Vec<usize> {
        let budget_left = self.slave_budget_left();
        let rank = self.effective_rank();

        (0..self.endpoints.len())
            .filter(|&i| {
                let ep = &self.endpoints[i];
                let server = ep.server();

                if server.in_maintenance() || !server.is_running() || server.is_draining() {
                    return false;
                }

                let acts_slave = server.is_slave()
                    || server.is_relay()
                    || (server.is_master() && self.config.master_accept_reads);
                let is_fallback_master = server.is_master() && !self.config.master_accept_reads;
                if !acts_slave && !is_fallback_master {
                    return false;
                }

                // In use, or openable within the replica budget.
                if !ep.in_use() && !is_fallback_master && budget_left == 0 {
                    return false;
                }

                if let Some(rank) = rank {
                    if server.rank() != rank {
                        return false;
                    }
                }

                if self.config.max_replication_lag > 0 && !server.is_master() {
                    let lag = server.replication_lag();
                    if lag == RLAG_UNDEFINED || lag > self.config.max_replication_lag {
                        return false;
                    }
                }

                if self.config.causal_reads.gates_on_gtid() && !server.is_master() {
                    if !self.gtid_reached(server) {
                        return false;
                    }
                }

                true
            })
            .collect()
    }

    fn slave_budget_left(&self) -> usize {
        let in_use = self
            .endpoints
            .iter()
            .filter(|ep| {
                ep.in_use() && (ep.server().is_slave() || ep.server().is_relay())
            })
            .count();
        self.config.max_slave_connections.saturating_sub(in_use)
    }

    fn effective_rank(&self) -> Option<i64> {
        if let Some(rank) = self.session_rank {
            return Some(rank);
        }
        // Before pinning, the best (lowest) rank among live servers.
        self.endpoints
            .iter()
            .filter(|ep| ep.server().is_running())
            .map(|ep| ep.server().rank())
            .min()
    }

    /// A sequence of 0 imposes no gate; otherwise every watermarked
    /// domain must have been reached.
    fn gtid_reached(&self, server: &Server) -> bool {
        self.watermark
            .iter()
            .all(|(&domain, &sequence)| sequence == 0 || server.gtid_pos(domain) >= sequence)
    }

    /// Keep only the best priority class, then apply the configured
    /// criterion; ties break on the oldest last-write timestamp.
    fn select_best(&self, candidates: &[usize]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let priority = |i: usize| -> u8 {
            let ep = &self.endpoints[i];
            let server = ep.server();
            let busy = ep.outstanding_replies() > 0;
            let acts_slave = server.is_slave()
                || server.is_relay()
                || (server.is_master() && self.config.master_accept_reads);
            if acts_slave {
                if busy {
                    1
                } else {
                    0
                }
            } else {
                // Idle master kept as last resort.
                2
            }
        };

        let best_priority = candidates.iter().map(|&i| priority(i)).min()?;
        let pool: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| priority(i) == best_priority)
            .collect();

        let score = |i: usize| -> f64 {
            let server = self.endpoints[i].server();
            use std::sync::atomic::Ordering::Relaxed;
            match self.config.slave_selection_criteria {
                SelectionCriteria::LeastGlobalConnections => {
                    server.stats.n_current_conns.load(Relaxed) as f64
                }
                SelectionCriteria::LeastRouterConnections => {
                    server.stats.n_router_conns.load(Relaxed) as f64
                }
                SelectionCriteria::LeastBehindMaster => {
                    let lag = server.replication_lag();
                    if lag == RLAG_UNDEFINED {
                        f64::MAX
                    } else {
                        lag as f64
                    }
                }
                SelectionCriteria::LeastCurrentOperations => {
                    server.stats.n_current_ops.load(Relaxed) as f64
                }
                SelectionCriteria::AdaptiveRouting => {
                    let avg = server.stats.response_time.average_secs();
                    let ops = server.stats.n_current_ops.load(Relaxed) as f64;
                    avg * (ops + 1.0)
                }
            }
        };

        pool.into_iter().min_by(|&a, &b| {
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.endpoints[a]
                        .server()
                        .last_write()
                        .cmp(&self.endpoints[b].server().last_write())
                })
        })
    }

    /// Record GTID positions observed in a master OK packet's session
    /// tracking payload. Format: `domain-server_id-sequence`, possibly a
    /// comma-separated list.
    pub fn note_gtid(&mut self, gtid: &str) {
        for part in gtid.split(',') {
            let mut fields = part.trim().splitn(3, '-');
            let (Some(domain), Some(_server), Some(sequence)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(domain), Ok(sequence)) = (domain.parse::<u32>(), sequence.parse::<u64>())
            else {
                continue;
            };
            let entry = self.watermark.entry(domain).or_insert(0);
            if sequence > *entry {
                *entry = sequence;
            }
            // The master has the position it just reported.
            if let Some(master) = self.master {
                self.endpoints[master].server().update_gtid(domain, sequence);
            }
        }
    }

    pub fn causal_reads_mode(&self) -> CausalReads {
        self.config.causal_reads
    }

    /// Mid-session reconnect is only safe when the session recorded its
    /// commands and no transaction is active or about to commit.
    pub fn can_recover(history_supported: bool, trx_active: bool, trx_ending: bool) -> bool {
        history_supported && !trx_active && !trx_ending
    }

    /// Release every endpoint into the pool (session shutdown).
    pub async fn close(&mut self, pool: &WorkerPool) {
        for ep in &mut self.endpoints {
            if ep.state() == EndpointState::Connected && ep.is_idle() {
                ep.release_to_pool(pool);
            } else {
                ep.close(pool).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerRole};
    use std::sync::atomic::Ordering::Relaxed;

    fn server(name: &str, role: ServerRole, rank: i64) -> Arc<Server> {
        Server::from_config(&ServerConfig {
            name: name.into(),
            host: "10.0.0.1".into(),
            port: 3306,
            rank,
            max_connections: 0,
            role,
        })
    }

    fn session_with(servers: Vec<Arc<Server>>, config: RouterConfig) -> RwSplitSession {
        let mut s = RwSplitSession::new(servers, config);
        s.master = s.locate_master();
        s
    }

    fn default_servers() -> Vec<Arc<Server>> {
        vec![
            server("m", ServerRole::Master, 1),
            server("r1", ServerRole::Slave, 1),
            server("r2", ServerRole::Slave, 1),
        ]
    }

    #[test]
    fn lag_gate_excludes_slow_replicas() {
        let servers = default_servers();
        servers[1].set_replication_lag(2);
        servers[2].set_replication_lag(8);

        let config = RouterConfig {
            max_replication_lag: 5,
            ..RouterConfig::default()
        };
        let session = session_with(servers.clone(), config);

        let candidates = session.read_candidates();
        let selected = session.select_best(&candidates).unwrap();
        assert_eq!(session.endpoints[selected].server().name(), "r1");

        // Lags swap; the other replica wins the next decision.
        servers[1].set_replication_lag(8);
        servers[2].set_replication_lag(2);
        let candidates = session.read_candidates();
        let selected = session.select_best(&candidates).unwrap();
        assert_eq!(session.endpoints[selected].server().name(), "r2");
    }

    #[test]
    fn unknown_lag_is_excluded_when_gated() {
        let servers = default_servers();
        servers[1].set_replication_lag(2);
        // r2 lag stays undefined.

        let config = RouterConfig {
            max_replication_lag: 5,
            ..RouterConfig::default()
        };
        let session = session_with(servers, config);
        let candidates = session.read_candidates();
        let names: Vec<&str> = candidates
            .iter()
            .map(|&i| session.endpoints[i].server().name())
            .collect();
        assert!(names.contains(&"r1"));
        assert!(!names.contains(&"r2"));
    }

    #[test]
    fn master_is_last_resort_for_reads() {
        let servers = default_servers();
        let session = session_with(servers, RouterConfig::default());

        let candidates = session.read_candidates();
        let selected = session.select_best(&candidates).unwrap();
        // Replicas beat the idle master.
        assert_ne!(session.endpoints[selected].server().name(), "m");

        // With only the master left, it is selected.
        let only_master = vec![0usize];
        assert_eq!(session.select_best(&only_master), Some(0));
    }

    #[test]
    fn least_global_connections_criterion() {
        let servers = default_servers();
        servers[1].stats.n_current_conns.store(5, Relaxed);
        servers[2].stats.n_current_conns.store(2, Relaxed);

        let config = RouterConfig {
            slave_selection_criteria: SelectionCriteria::LeastGlobalConnections,
            ..RouterConfig::default()
        };
        let session = session_with(servers, config);
        let candidates = session.read_candidates();
        let selected = session.select_best(&candidates).unwrap();
        assert_eq!(session.endpoints[selected].server().name(), "r2");
    }

    #[test]
    fn adaptive_routing_weighs_ops_and_response_time() {
        let servers = default_servers();
        // r1: fast but busy. r2: slower but idle.
        servers[1]
            .stats
            .response_time
            .record(std::time::Duration::from_millis(10));
        servers[1].stats.n_current_ops.store(9, Relaxed);
        servers[2]
            .stats
            .response_time
            .record(std::time::Duration::from_millis(30));

        let config = RouterConfig {
            slave_selection_criteria: SelectionCriteria::AdaptiveRouting,
            ..RouterConfig::default()
        };
        let session = session_with(servers, config);
        let candidates = session.read_candidates();
        let selected = session.select_best(&candidates).unwrap();
        // 0.01 * 10 = 0.1 vs 0.03 * 1 = 0.03.
        assert_eq!(session.endpoints[selected].server().name(), "r2");
    }

    #[test]
    fn selection_is_deterministic() {
        let servers = default_servers();
        let session = session_with(servers, RouterConfig::default());
        let candidates = session.read_candidates();
        let first = session.select_best(&candidates);
        for _ in 0..10 {
            assert_eq!(session.select_best(&candidates), first);
        }
    }

    #[test]
    fn rank_gate_prefers_best_rank() {
        let servers = vec![
            server("m", ServerRole::Master, 1),
            server("r1", ServerRole::Slave, 1),
            server("far", ServerRole::Slave, 2),
        ];
        let session = session_with(servers, RouterConfig::default());
        let candidates = session.read_candidates();
        let names: Vec<&str> = candidates
            .iter()
            .map(|&i| session.endpoints[i].server().name())
            .collect();
        assert!(names.contains(&"r1"));
        assert!(!names.contains(&"far"));
    }

    #[test]
    fn causal_reads_gate() {
        let servers = default_servers();
        let config = RouterConfig {
            causal_reads: CausalReads::Fast,
            ..RouterConfig::default()
        };
        let mut session = session_with(servers.clone(), config);

        // Sequence 0 imposes no gate.
        session.watermark.insert(0, 0);
        assert!(session.gtid_reached(&servers[1]));

        session.note_gtid("0-1-42");
        assert!(!session.gtid_reached(&servers[1]));

        servers[1].update_gtid(0, 42);
        assert!(session.gtid_reached(&servers[1]));
        // The master's own position advanced too.
        assert_eq!(servers[0].gtid_pos(0), 42);
    }

    #[test]
    fn gtid_watermark_never_regresses() {
        let servers = default_servers();
        let mut session = session_with(servers, RouterConfig::default());
        session.note_gtid("0-1-42");
        session.note_gtid("0-1-7");
        assert_eq!(session.watermark[&0], 42);
    }

    #[test]
    fn recover_gating() {
        assert!(RwSplitSession::can_recover(true, false, false));
        assert!(!RwSplitSession::can_recover(false, false, false));
        assert!(!RwSplitSession::can_recover(true, true, false));
        assert!(!RwSplitSession::can_recover(true, false, true));
    }

    #[test]
    fn no_master_error_follows_failure_mode() {
        let servers = vec![server("r1", ServerRole::Slave, 1)];
        let session = session_with(
            servers.clone(),
            RouterConfig {
                master_failure_mode: MasterFailureMode::ErrorOnWrite,
                ..RouterConfig::default()
            },
        );
        assert!(!session.no_master_error().fatal);

        let session = session_with(servers, RouterConfig::default());
        assert!(session.no_master_error().fatal);
    }
}
