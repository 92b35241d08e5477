use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listener: ListenerConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub user_manager: UserManagerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Name of the service new sessions attach to. Defaults to the first
    /// configured service.
    #[serde(default)]
    pub service: Option<String>,
    /// Require TLS from every client.
    #[serde(default)]
    pub require_ssl: bool,
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
    /// Networks allowed to prefix their connection with a PROXY header.
    #[serde(default)]
    pub proxy_protocol_networks: Vec<IpNet>,
    /// How database names are compared during user lookup.
    #[serde(default)]
    pub db_name_case: DbNameCase,
    /// Match entry host patterns against the client address. When off,
    /// the first entry for the username wins regardless of host.
    #[serde(default = "default_true")]
    pub match_host_pattern: bool,
    #[serde(default)]
    pub allow_anonymous_user: bool,
    #[serde(default)]
    pub allow_root_user: bool,
    /// Never attempt reverse name resolution for host patterns.
    #[serde(default)]
    pub skip_name_resolve: bool,
    /// Failed authentications from one host before it is blocked.
    #[serde(default = "default_max_auth_errors")]
    pub max_auth_errors_until_block: u32,
    /// Seconds a client has to finish authentication, measured from accept.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Close sessions idle for this many seconds (0 = never).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Number of routing workers. Sessions are bound to one for life.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Offset added to the listen port for the metrics endpoint.
    #[serde(default = "default_metrics_port_offset")]
    pub metrics_port_offset: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbNameCase {
    /// Compare exactly as sent.
    #[default]
    Sensitive,
    /// Lowercase the requested name before comparing.
    Lower,
    /// Preserve the name but compare case-insensitively.
    Insensitive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Version string announced in the initial handshake.
    #[serde(default = "default_version_string")]
    pub version_string: String,
    /// Credentials used for backend connections and user fetching.
    pub user: String,
    pub password: String,
    /// Targets this service routes to: server names or other services.
    pub targets: Vec<String>,
    /// Permit COM_BINLOG_DUMP through this service.
    #[serde(default)]
    pub allow_replication: bool,
    /// Sessions echo the first backend's authentication verdict instead
    /// of checking the token locally.
    #[serde(default)]
    pub passthrough_auth: bool,
    /// Filters applied between client and router, in order.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Log every routed statement.
    QueryLog {
        #[serde(default)]
        log_replies: bool,
    },
    /// Reject statements matching any of the given substrings.
    Deny { patterns: Vec<String> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Operator-assigned preference; sessions pin to one rank.
    #[serde(default = "default_rank")]
    pub rank: i64,
    /// Per-worker cap on routing connections to this server (0 = unlimited).
    /// Sessions over the cap buffer their packets until a slot frees.
    #[serde(default)]
    pub max_connections: usize,
    /// Initial role before any status updates arrive.
    #[serde(default)]
    pub role: ServerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Master,
    #[default]
    Slave,
    Relay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserManagerConfig {
    /// Minimum seconds between consecutive loads (throttle).
    #[serde(default = "default_users_refresh_min")]
    pub refresh_min_interval_secs: u64,
    /// Maximum seconds between loads (heartbeat). 0 disables the timer.
    #[serde(default)]
    pub refresh_max_interval_secs: u64,
    /// Fetch from every backend and keep the union instead of stopping at
    /// the first success.
    #[serde(default)]
    pub union_over_backends: bool,
    /// Remove backslash escapes from database names read from backends.
    #[serde(default = "default_true")]
    pub strip_db_esc: bool,
    /// Optional JSON file layered over (or replacing) backend data.
    #[serde(default)]
    pub users_file: Option<String>,
    #[serde(default)]
    pub users_file_usage: UsersFileUsage,
    /// Successful loads before throttling engages.
    #[serde(default = "default_loads_before_throttle")]
    pub loads_before_throttle: u32,
    /// Consecutive failures before throttling engages anyway.
    #[serde(default = "default_failures_before_throttle")]
    pub failures_before_throttle: u32,
}

impl Default for UserManagerConfig {
    fn default() -> Self {
        Self {
            refresh_min_interval_secs: default_users_refresh_min(),
            refresh_max_interval_secs: 0,
            union_over_backends: false,
            strip_db_esc: true,
            users_file: None,
            users_file_usage: UsersFileUsage::default(),
            loads_before_throttle: default_loads_before_throttle(),
            failures_before_throttle: default_failures_before_throttle(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsersFileUsage {
    /// File entries are added on top of a successful backend load.
    #[default]
    AddWhenLoadOk,
    /// The file is the only source; backends are not queried.
    FileOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub slave_selection_criteria: SelectionCriteria,
    /// Replica links kept open per session.
    #[serde(default = "default_max_slave_connections")]
    pub max_slave_connections: usize,
    /// Highest acceptable replication lag in seconds. 0 means unlimited.
    #[serde(default)]
    pub max_replication_lag: i64,
    #[serde(default)]
    pub causal_reads: CausalReads,
    #[serde(default = "default_causal_reads_timeout")]
    pub causal_reads_timeout_secs: u64,
    #[serde(default)]
    pub master_failure_mode: MasterFailureMode,
    #[serde(default)]
    pub master_accept_reads: bool,
    /// Open backend connections on first use instead of at session start.
    #[serde(default)]
    pub lazy_connect: bool,
    /// Allow replacing a lost master connection mid-session.
    #[serde(default)]
    pub master_reconnection: bool,
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
    /// Emit old-protocol resultsets: suppress DEPRECATE_EOF, metadata
    /// caching and extended types during capability negotiation.
    #[serde(default)]
    pub old_protocol_only: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection_criteria: SelectionCriteria::default(),
            max_slave_connections: default_max_slave_connections(),
            max_replication_lag: 0,
            causal_reads: CausalReads::default(),
            causal_reads_timeout_secs: default_causal_reads_timeout(),
            master_failure_mode: MasterFailureMode::default(),
            master_accept_reads: false,
            lazy_connect: false,
            master_reconnection: false,
            retry_failed_reads: true,
            old_protocol_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriteria {
    LeastGlobalConnections,
    LeastRouterConnections,
    LeastBehindMaster,
    #[default]
    LeastCurrentOperations,
    AdaptiveRouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalReads {
    #[default]
    None,
    Local,
    Global,
    Fast,
    FastGlobal,
    FastUniversal,
}

impl CausalReads {
    /// Modes that gate replica selection on an observed GTID watermark.
    pub fn gates_on_gtid(&self) -> bool {
        matches!(
            self,
            CausalReads::Fast | CausalReads::FastGlobal | CausalReads::FastUniversal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Close the session as soon as the master goes away.
    #[default]
    FailInstantly,
    /// Keep serving reads; fail when a write arrives.
    FailOnWrite,
    /// Keep serving reads; answer writes with an error.
    ErrorOnWrite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum pooled connections per (target, credentials) per worker.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Seconds a pooled connection may idle before being dropped.
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Maximum age of a pooled connection.
    #[serde(default = "default_pool_max_lifetime")]
    pub max_lifetime_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            idle_timeout_secs: default_pool_idle_timeout(),
            max_lifetime_secs: default_pool_max_lifetime(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Map an authenticated client user to different backend credentials.
    #[serde(default)]
    pub user_mapping: Vec<UserMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMapping {
    pub from_user: String,
    pub to_user: String,
    #[serde(default)]
    pub to_password: String,
}

fn default_listen_port() -> u16 {
    4006
}

fn default_server_port() -> u16 {
    3306
}

fn default_version_string() -> String {
    "10.6.14-hermes".to_string()
}

fn default_rank() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_auth_errors() -> u32 {
    10
}

fn default_auth_timeout_secs() -> u64 {
    60
}

fn default_worker_threads() -> usize {
    4
}

fn default_metrics_port_offset() -> u16 {
    1000
}

fn default_users_refresh_min() -> u64 {
    30
}

fn default_loads_before_throttle() -> u32 {
    3
}

fn default_failures_before_throttle() -> u32 {
    5
}

fn default_max_slave_connections() -> usize {
    255
}

fn default_causal_reads_timeout() -> u64 {
    10
}

fn default_max_pool_size() -> usize {
    50
}

fn default_pool_idle_timeout() -> u64 {
    300
}

fn default_pool_max_lifetime() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listener: ListenerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
                service: None,
                require_ssl: false,
                ssl_cert: None,
                ssl_key: None,
                proxy_protocol_networks: vec![],
                db_name_case: DbNameCase::default(),
                match_host_pattern: true,
                allow_anonymous_user: false,
                allow_root_user: false,
                skip_name_resolve: false,
                max_auth_errors_until_block: default_max_auth_errors(),
                auth_timeout_secs: default_auth_timeout_secs(),
                idle_timeout_secs: 0,
                worker_threads: default_worker_threads(),
                metrics_port_offset: default_metrics_port_offset(),
            },
            services: vec![],
            servers: vec![],
            user_manager: UserManagerConfig::default(),
            router: RouterConfig::default(),
            pool: PoolConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}
