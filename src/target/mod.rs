//! Shared server objects: status, rank, replication position and the
//! atomic statistics the routing policy reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::config::{ServerConfig, ServerRole};

/// Replication lag value meaning "not known".
pub const RLAG_UNDEFINED: i64 = -1;

/// Server status bits. Monitors (external to this crate) and backend
/// handshakes update these; the router only reads them.
pub mod status {
    pub const RUNNING: u32 = 1;
    pub const MASTER: u32 = 1 << 1;
    pub const SLAVE: u32 = 1 << 2;
    pub const RELAY: u32 = 1 << 3;
    pub const MAINTENANCE: u32 = 1 << 4;
    pub const DRAINING: u32 = 1 << 5;
}

/// Parsed backend version, used to mask capabilities during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub is_mariadb: bool,
    pub is_xpand: bool,
}

impl ServerVersion {
    /// Parse a version string such as `5.5.5-10.6.14-MariaDB-log` or
    /// `8.0.33`. MariaDB hides its real version behind the `5.5.5-`
    /// replication-compatibility prefix.
    pub fn parse(version: &str) -> Self {
        let lower = version.to_ascii_lowercase();
        let is_mariadb = lower.contains("mariadb");
        let is_xpand = lower.contains("xpand") || lower.contains("clustrix");

        let effective = version.strip_prefix("5.5.5-").unwrap_or(version);
        let mut nums = effective
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<u32>().ok());

        Self {
            major: nums.next().unwrap_or(0),
            minor: nums.next().unwrap_or(0),
            patch: nums.next().unwrap_or(0),
            is_mariadb,
            is_xpand,
        }
    }

    /// Version as a single comparable number: major * 10000 + minor * 100 + patch.
    pub fn total(&self) -> u32 {
        self.major * 10_000 + self.minor * 100 + self.patch
    }
}

/// Exponentially weighted response-time average, stored as nanoseconds in
/// an atomic so readers never lock.
#[derive(Debug, Default)]
pub struct ResponseTimeAverage {
    nanos: AtomicU64,
}

const EMA_ALPHA: f64 = 0.04;

impl ResponseTimeAverage {
    pub fn record(&self, sample: std::time::Duration) {
        let sample = sample.as_nanos() as f64;
        let mut current = self.nanos.load(Ordering::Relaxed);
        loop {
            let avg = current as f64;
            let next = if avg == 0.0 {
                sample
            } else {
                avg + EMA_ALPHA * (sample - avg)
            };
            match self.nanos.compare_exchange_weak(
                current,
                next as u64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    /// Average in seconds; zero when no sample has been recorded.
    pub fn average_secs(&self) -> f64 {
        self.nanos.load(Ordering::Relaxed) as f64 / 1e9
    }
}

/// Per-server statistics consulted by the balancing policy.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections currently open from any session of this process.
    pub n_current_conns: AtomicUsize,
    /// Connections opened by the owning router only.
    pub n_router_conns: AtomicUsize,
    /// Requests routed and not yet answered.
    pub n_current_ops: AtomicUsize,
    /// All connections ever opened.
    pub n_total_conns: AtomicU64,
    /// Monotonic timestamp (nanos since process start) of the last write
    /// routed here. Used as the tie-breaker in backend selection.
    pub last_write: AtomicU64,
    pub response_time: ResponseTimeAverage,
}

/// A connectable backend server.
#[derive(Debug)]
pub struct Server {
    name: String,
    host: String,
    port: u16,
    rank: i64,
    max_connections: usize,
    status: AtomicU32,
    replication_lag: AtomicI64,
    gtid_positions: RwLock<HashMap<u32, u64>>,
    version: RwLock<Option<ServerVersion>>,
    capabilities: AtomicU64,
    pub stats: ServerStats,
}

impl Server {
    pub fn from_config(config: &ServerConfig) -> Arc<Self> {
        let initial_status = status::RUNNING
            | match config.role {
                ServerRole::Master => status::MASTER,
                ServerRole::Slave => status::SLAVE,
                ServerRole::Relay => status::RELAY,
            };

        Arc::new(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            rank: config.rank,
            max_connections: config.max_connections,
            status: AtomicU32::new(initial_status),
            replication_lag: AtomicI64::new(RLAG_UNDEFINED),
            gtid_positions: RwLock::new(HashMap::new()),
            version: RwLock::new(None),
            capabilities: AtomicU64::new(0),
            stats: ServerStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn is_running(&self) -> bool {
        let s = self.status();
        s & status::RUNNING != 0 && s & status::MAINTENANCE == 0
    }

    pub fn is_master(&self) -> bool {
        self.is_running() && self.status() & status::MASTER != 0
    }

    pub fn is_slave(&self) -> bool {
        self.is_running() && self.status() & status::SLAVE != 0
    }

    pub fn is_relay(&self) -> bool {
        self.is_running() && self.status() & status::RELAY != 0
    }

    pub fn in_maintenance(&self) -> bool {
        self.status() & status::MAINTENANCE != 0
    }

    pub fn is_draining(&self) -> bool {
        self.status() & status::DRAINING != 0
    }

    /// Replication lag in seconds, [`RLAG_UNDEFINED`] when unknown.
    pub fn replication_lag(&self) -> i64 {
        self.replication_lag.load(Ordering::Acquire)
    }

    pub fn set_replication_lag(&self, lag: i64) {
        self.replication_lag.store(lag, Ordering::Release);
    }

    /// GTID sequence for a replication domain; 0 when never seen.
    pub fn gtid_pos(&self, domain: u32) -> u64 {
        self.gtid_positions
            .read()
            .get(&domain)
            .copied()
            .unwrap_or(0)
    }

    /// Record an observed GTID position; positions never move backwards.
    pub fn update_gtid(&self, domain: u32, sequence: u64) {
        let mut positions = self.gtid_positions.write();
        let entry = positions.entry(domain).or_insert(0);
        if sequence > *entry {
            *entry = sequence;
        }
    }

    pub fn version(&self) -> Option<ServerVersion> {
        *self.version.read()
    }

    /// Capabilities the backend advertised in its handshake; 0 until the
    /// first connection (or probe) has been made.
    pub fn capabilities(&self) -> u64 {
        self.capabilities.load(Ordering::Acquire)
    }

    /// Record version and capabilities observed in a backend handshake.
    pub fn update_handshake_info(&self, version_string: &str, capabilities: u64) {
        *self.version.write() = Some(ServerVersion::parse(version_string));
        self.capabilities.store(capabilities, Ordering::Release);
    }

    pub fn connection_opened(&self) {
        self.stats.n_current_conns.fetch_add(1, Ordering::Relaxed);
        self.stats.n_total_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.stats.n_current_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn operation_started(&self) {
        self.stats.n_current_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_finished(&self, elapsed: std::time::Duration) {
        self.stats.n_current_ops.fetch_sub(1, Ordering::Relaxed);
        self.stats.response_time.record(elapsed);
    }

    pub fn note_write(&self) {
        self.stats
            .last_write
            .store(monotonic_nanos(), Ordering::Relaxed);
    }

    pub fn last_write(&self) -> u64 {
        self.stats.last_write.load(Ordering::Relaxed)
    }
}

fn monotonic_nanos() -> u64 {
    use once_cell::sync::Lazy;
    static START: Lazy<Instant> = Lazy::new(Instant::now);
    START.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server(role: ServerRole) -> Arc<Server> {
        Server::from_config(&ServerConfig {
            name: "db1".into(),
            host: "10.0.0.1".into(),
            port: 3306,
            rank: 1,
            max_connections: 0,
            role,
        })
    }

    #[test]
    fn version_parse_mariadb_prefix() {
        let v = ServerVersion::parse("5.5.5-10.6.14-MariaDB-log");
        assert_eq!((v.major, v.minor, v.patch), (10, 6, 14));
        assert!(v.is_mariadb);
        assert_eq!(v.total(), 100_614);
    }

    #[test]
    fn version_parse_mysql() {
        let v = ServerVersion::parse("8.0.33");
        assert_eq!((v.major, v.minor, v.patch), (8, 0, 33));
        assert!(!v.is_mariadb);
    }

    #[test]
    fn version_parse_xpand() {
        let v = ServerVersion::parse("5.0.45-Xpand-6.1.1");
        assert!(v.is_xpand);
    }

    #[test]
    fn status_transitions() {
        let server = test_server(ServerRole::Slave);
        assert!(server.is_slave());
        assert!(!server.is_master());

        server.set_status(status::MAINTENANCE);
        assert!(!server.is_slave());
        assert!(server.in_maintenance());

        server.clear_status(status::MAINTENANCE);
        assert!(server.is_slave());
    }

    #[test]
    fn gtid_never_regresses() {
        let server = test_server(ServerRole::Slave);
        server.update_gtid(0, 100);
        server.update_gtid(0, 50);
        assert_eq!(server.gtid_pos(0), 100);
        assert_eq!(server.gtid_pos(7), 0);
    }

    #[test]
    fn response_time_average_converges() {
        let avg = ResponseTimeAverage::default();
        avg.record(std::time::Duration::from_millis(100));
        let first = avg.average_secs();
        assert!((first - 0.1).abs() < 1e-6);

        for _ in 0..200 {
            avg.record(std::time::Duration::from_millis(10));
        }
        assert!(avg.average_secs() < 0.05);
    }
}
