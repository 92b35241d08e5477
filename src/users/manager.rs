//! Background synchronization of the user-account database.
//!
//! One task per process fetches account data from the backends, builds an
//! immutable [`UserDatabase`] and publishes it through an atomically
//! swapped pointer. Workers copy the pointer into their local caches on
//! demand. Two timers drive the loop: a minimum interval between loads
//! (throttle) and an optional maximum interval (heartbeat). Explicit
//! refresh requests from sessions bypass the heartbeat but never the
//! throttle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::backend::{ClientError, LocalClient, QueryOutcome, ResultSet};
use crate::config::{UserManagerConfig, UsersFileUsage};
use crate::protocol::DEFAULT_AUTH_PLUGIN;
use crate::target::Server;

use super::database::UserDatabase;
use super::entry::{strip_password_star, UserEntry};
use super::file::apply_users_file;

const USERS_QUERY: &str = "SELECT user, host, password, plugin, authentication_string, \
     default_role, is_role, super_priv, ssl_type, select_priv, insert_priv, update_priv, \
     delete_priv FROM mysql.user";
/// Servers without MariaDB's role columns.
const USERS_QUERY_COMPAT: &str = "SELECT user, host, '' AS password, plugin, \
     authentication_string, '' AS default_role, 'N' AS is_role, super_priv, ssl_type, \
     select_priv, insert_priv, update_priv, delete_priv FROM mysql.user";
const DB_WILDCARD_QUERY: &str = "SELECT user, host, db FROM mysql.db";
const DB_LITERAL_QUERY: &str = "SELECT user, host, db FROM mysql.tables_priv \
     UNION SELECT user, host, db FROM mysql.columns_priv \
     UNION SELECT user, host, db FROM mysql.procs_priv";
/// Used when the service account lacks access to procs_priv.
const DB_LITERAL_QUERY_FALLBACK: &str = "SELECT user, host, db FROM mysql.tables_priv \
     UNION SELECT user, host, db FROM mysql.columns_priv";
const PROXIES_QUERY: &str = "SELECT user, host FROM mysql.proxies_priv";
const DATABASES_QUERY: &str = "SHOW DATABASES";
const ROLES_QUERY: &str = "SELECT user, host, role FROM mysql.roles_mapping";

/// Access denied to a table; triggers the no-procs fallback.
const ER_TABLEACCESS_DENIED: u16 = 1142;

pub struct UserManager {
    config: UserManagerConfig,
    username: String,
    password: String,
    servers: Vec<Arc<Server>>,
    db: ArcSwap<UserDatabase>,
    version: AtomicI64,
    refresh_requested: Notify,
    shutdown: AtomicBool,
    /// Instant of the last completed load attempt; gates the throttle.
    last_load: Mutex<Option<Instant>>,
    /// Broadcasts the version so parked sessions wake on publication.
    version_tx: watch::Sender<i64>,
}

impl UserManager {
    pub fn new(
        config: UserManagerConfig,
        username: String,
        password: String,
        servers: Vec<Arc<Server>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            username,
            password,
            servers,
            db: ArcSwap::from_pointee(UserDatabase::default()),
            version: AtomicI64::new(0),
            refresh_requested: Notify::new(),
            shutdown: AtomicBool::new(false),
            last_load: Mutex::new(None),
            version_tx: watch::channel(0).0,
        })
    }

    pub fn snapshot(&self) -> Arc<UserDatabase> {
        self.db.load_full()
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Ask the updater to run as soon as the throttle allows.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Watch the version counter; parked sessions resume when it moves.
    pub fn subscribe_version(&self) -> watch::Receiver<i64> {
        self.version_tx.subscribe()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.refresh_requested.notify_one();
    }

    /// True when a refresh request would be honored without waiting for
    /// the minimum interval.
    pub fn can_update_immediately(&self) -> bool {
        match *self.last_load.lock() {
            Some(at) => at.elapsed() >= self.min_interval(),
            None => true,
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(self.config.refresh_min_interval_secs)
    }

    /// The update loop. Spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut successful_loads = 0u32;
        let mut consecutive_failures = 0u32;

        info!("user account manager started");

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match self.update_users().await {
                Ok(changed) => {
                    successful_loads += 1;
                    consecutive_failures = 0;
                    if changed {
                        info!(version = self.version(), "user accounts updated");
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    // Repeat warnings get demoted once the condition persists.
                    if consecutive_failures <= self.config.failures_before_throttle {
                        warn!(error = %e, "user account load failed");
                    } else {
                        debug!(error = %e, "user account load failed");
                    }
                }
            }
            *self.last_load.lock() = Some(Instant::now());

            let throttled = successful_loads >= self.config.loads_before_throttle
                || consecutive_failures >= self.config.failures_before_throttle;

            if !throttled {
                // Before throttling engages, retry briskly so slow-starting
                // backends get picked up without waiting a full interval.
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            // Enforce the minimum interval unconditionally, then wait for
            // a request or the heartbeat.
            tokio::time::sleep(self.min_interval()).await;
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let max = self.config.refresh_max_interval_secs;
            if max > self.config.refresh_min_interval_secs {
                let heartbeat = Duration::from_secs(max - self.config.refresh_min_interval_secs);
                tokio::select! {
                    _ = self.refresh_requested.notified() => {}
                    _ = tokio::time::sleep(heartbeat) => {}
                }
            } else if max > 0 {
                // Heartbeat shorter than the throttle: run immediately.
            } else {
                self.refresh_requested.notified().await;
            }
        }

        info!("user account manager stopped");
    }

    /// One load iteration. Returns whether a new snapshot was published.
    async fn update_users(&self) -> Result<bool, ClientError> {
        let mut fresh = UserDatabase::default();

        if self.config.users_file_usage == UsersFileUsage::FileOnly {
            self.layer_users_file(&mut fresh, true)?;
        } else {
            let mut loaded_any = false;
            for server in self.ranked_backends() {
                match self.load_from_backend(&server).await {
                    Ok(part) => {
                        loaded_any = true;
                        if self.config.union_over_backends {
                            fresh.merge(part);
                        } else {
                            fresh = part;
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(server = server.name(), error = %e, "user fetch failed");
                    }
                }
            }
            if !loaded_any {
                return Err(ClientError::Connect(
                    "no backend produced user account data".into(),
                ));
            }
            if self.config.users_file_usage == UsersFileUsage::AddWhenLoadOk {
                self.layer_users_file(&mut fresh, false)?;
            }
        }

        // Publish only when the content actually differs.
        let current = self.db.load();
        if **current == fresh {
            return Ok(false);
        }
        self.db.store(Arc::new(fresh));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.version_tx.send(version);
        crate::metrics::metrics().record_userdb_update(version);
        Ok(true)
    }

    fn layer_users_file(&self, output: &mut UserDatabase, required: bool) -> Result<(), ClientError> {
        let Some(path) = &self.config.users_file else {
            return if required {
                Err(ClientError::Protocol(
                    "users_file_usage=file_only but no users_file configured".into(),
                ))
            } else {
                Ok(())
            };
        };
        match apply_users_file(&PathBuf::from(path), output) {
            Ok(()) => Ok(()),
            Err(e) if required => Err(ClientError::Protocol(e.to_string())),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable users file");
                Ok(())
            }
        }
    }

    /// Primary first, then replicas, then anything else; rank breaks ties.
    fn ranked_backends(&self) -> Vec<Arc<Server>> {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .filter(|s| s.is_running())
            .cloned()
            .collect();
        servers.sort_by_key(|s| {
            let class = if s.is_master() {
                0
            } else if s.is_slave() {
                1
            } else {
                2
            };
            (class, s.rank())
        });
        servers
    }

    async fn load_from_backend(&self, server: &Arc<Server>) -> Result<UserDatabase, ClientError> {
        let mut client =
            LocalClient::connect(&server.address(), &self.username, &self.password, None).await?;
        server.update_handshake_info(&client.server_version, client.server_capabilities);

        let is_mariadb = client.server_version.to_ascii_lowercase().contains("mariadb");
        let users_query = if is_mariadb {
            USERS_QUERY
        } else {
            USERS_QUERY_COMPAT
        };

        let queries = [
            users_query,
            DB_WILDCARD_QUERY,
            DB_LITERAL_QUERY,
            PROXIES_QUERY,
            DATABASES_QUERY,
            ROLES_QUERY,
        ];
        let mut outcomes = client.multi_query(&queries).await?;

        // The batch aborts at the first failing statement. Privilege
        // errors on procs_priv get one retry without it; anything else
        // falls back to statement-at-a-time with optional pieces skipped.
        if outcomes.len() < queries.len() {
            let privilege_issue = outcomes
                .last()
                .and_then(|o| o.error())
                .map(|e| e.error_code == ER_TABLEACCESS_DENIED)
                .unwrap_or(false);
            if privilege_issue {
                let fallback = [
                    users_query,
                    DB_WILDCARD_QUERY,
                    DB_LITERAL_QUERY_FALLBACK,
                    PROXIES_QUERY,
                    DATABASES_QUERY,
                    ROLES_QUERY,
                ];
                outcomes = client.multi_query(&fallback).await?;
            }
        }
        if outcomes.len() < 5 {
            return Err(ClientError::Protocol(format!(
                "user query batch aborted after {} results",
                outcomes.len()
            )));
        }

        let mut output = UserDatabase::default();
        self.read_users(rows(&outcomes[0])?, &mut output)?;
        self.read_db_grants(rows(&outcomes[1])?, rows(&outcomes[2])?, &mut output);
        self.read_proxy_grants(rows(&outcomes[3])?, &mut output);
        self.read_databases(rows(&outcomes[4])?, &mut output);
        if let Some(roles) = outcomes.get(5).and_then(|o| o.rows()) {
            self.read_roles(roles, &mut output);
        }

        debug!(
            server = server.name(),
            users = output.n_usernames(),
            entries = output.n_entries(),
            "loaded user accounts"
        );
        Ok(output)
    }

    fn read_users(&self, rs: &ResultSet, output: &mut UserDatabase) -> Result<(), ClientError> {
        let col = |name: &str| column_index(rs, name);
        let (Some(user), Some(host)) = (col("user"), col("host")) else {
            return Err(ClientError::Protocol("user query missing columns".into()));
        };
        let password = col("password");
        let plugin = col("plugin");
        let auth_string = col("authentication_string");
        let default_role = col("default_role");
        let is_role = col("is_role");
        let super_priv = col("super_priv");
        let ssl_type = col("ssl_type");
        let privs: Vec<usize> = ["select_priv", "insert_priv", "update_priv", "delete_priv"]
            .iter()
            .filter_map(|n| col(n))
            .collect();

        for row in &rs.rows {
            let password_hash = {
                let pw = cell(row, password);
                if pw.is_empty() {
                    strip_password_star(cell(row, auth_string))
                } else {
                    strip_password_star(pw)
                }
            };

            let plugin_name = {
                let p = cell(row, plugin);
                if p.is_empty() {
                    DEFAULT_AUTH_PLUGIN.to_string()
                } else {
                    p.to_string()
                }
            };

            output.add_entry(UserEntry {
                username: cell(row, Some(user)).to_string(),
                host_pattern: cell(row, Some(host)).to_string(),
                password_hash,
                auth_plugin: plugin_name,
                is_role: is_yes(cell(row, is_role)),
                default_role: cell(row, default_role).to_string(),
                global_db_priv: privs.iter().any(|&i| is_yes(cell(row, Some(i)))),
                super_priv: is_yes(cell(row, super_priv)),
                proxy_priv: false,
                ssl_required: !cell(row, ssl_type).is_empty(),
            });
        }
        Ok(())
    }

    fn read_db_grants(&self, wildcard: &ResultSet, literal: &ResultSet, output: &mut UserDatabase) {
        for row in &wildcard.rows {
            if let [Some(user), Some(host), Some(db)] = &row[..] {
                let db = if self.config.strip_db_esc {
                    db.replace('\\', "")
                } else {
                    db.clone()
                };
                output.add_db_wildcard_grant(user, host, db);
            }
        }
        for row in &literal.rows {
            if let [Some(user), Some(host), Some(db)] = &row[..] {
                output.add_db_grant(user, host, db.clone());
            }
        }
    }

    fn read_proxy_grants(&self, rs: &ResultSet, output: &mut UserDatabase) {
        for row in &rs.rows {
            if let [Some(user), Some(host), ..] = &row[..] {
                output.set_proxy_priv(user, host);
            }
        }
    }

    fn read_databases(&self, rs: &ResultSet, output: &mut UserDatabase) {
        for row in &rs.rows {
            if let Some(Some(name)) = row.first() {
                output.add_database_name(name.clone());
            }
        }
    }

    fn read_roles(&self, rs: &ResultSet, output: &mut UserDatabase) {
        for row in &rs.rows {
            if let [Some(user), Some(host), Some(role)] = &row[..] {
                output.add_role_mapping(user, host, role.clone());
            }
        }
    }
}

fn rows(outcome: &QueryOutcome) -> Result<&ResultSet, ClientError> {
    match outcome {
        QueryOutcome::Rows(rs) => Ok(rs),
        QueryOutcome::Done(_) => Err(ClientError::Protocol("expected rows, got OK".into())),
        QueryOutcome::Failed(err) => Err(ClientError::Server {
            code: err.error_code,
            message: err.error_message.clone(),
        }),
    }
}

fn column_index(rs: &ResultSet, name: &str) -> Option<usize> {
    rs.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
}

fn cell<'a>(row: &'a [Option<String>], index: Option<usize>) -> &'a str {
    index
        .and_then(|i| row.get(i))
        .and_then(|v| v.as_deref())
        .unwrap_or("")
}

fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("Y") || value == "1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserManagerConfig;

    fn manager() -> Arc<UserManager> {
        UserManager::new(
            UserManagerConfig::default(),
            "maxuser".into(),
            "maxpwd".into(),
            vec![],
        )
    }

    fn users_resultset() -> ResultSet {
        ResultSet {
            columns: vec![
                "user",
                "host",
                "password",
                "plugin",
                "authentication_string",
                "default_role",
                "is_role",
                "super_priv",
                "ssl_type",
                "select_priv",
                "insert_priv",
                "update_priv",
                "delete_priv",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            rows: vec![
                vec![
                    Some("alice".into()),
                    Some("%".into()),
                    Some("*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19".into()),
                    Some("mysql_native_password".into()),
                    Some("".into()),
                    Some("".into()),
                    Some("N".into()),
                    Some("N".into()),
                    Some("".into()),
                    Some("Y".into()),
                    Some("N".into()),
                    Some("N".into()),
                    Some("N".into()),
                ],
                vec![
                    Some("reader".into()),
                    Some("".into()),
                    Some("".into()),
                    Some("".into()),
                    Some("".into()),
                    Some("".into()),
                    Some("Y".into()),
                    Some("N".into()),
                    Some("".into()),
                    Some("N".into()),
                    Some("N".into()),
                    Some("N".into()),
                    Some("N".into()),
                ],
            ],
        }
    }

    #[test]
    fn users_rows_become_entries() {
        let mgr = manager();
        let mut db = UserDatabase::default();
        mgr.read_users(&users_resultset(), &mut db).unwrap();

        let alice = db.find_entry_equal("alice", "%").unwrap();
        assert_eq!(
            alice.password_hash,
            "2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19"
        );
        assert!(alice.global_db_priv);
        assert!(!alice.is_role);

        let role = db.find_entry_equal("reader", "").unwrap();
        assert!(role.is_role);
        assert_eq!(role.auth_plugin, DEFAULT_AUTH_PLUGIN);
    }

    #[test]
    fn strip_db_esc_removes_backslashes() {
        let mgr = manager();
        let mut db = UserDatabase::default();
        mgr.read_users(&users_resultset(), &mut db).unwrap();

        let wildcard = ResultSet {
            columns: vec!["user".into(), "host".into(), "db".into()],
            rows: vec![vec![
                Some("alice".into()),
                Some("%".into()),
                Some("test\\_db".into()),
            ]],
        };
        let literal = ResultSet {
            columns: vec!["user".into(), "host".into(), "db".into()],
            rows: vec![],
        };
        mgr.read_db_grants(&wildcard, &literal, &mut db);
        db.add_database_name("test_db".into());

        let alice = db.find_entry_equal("alice", "%").unwrap().clone();
        // With the escape removed, `_` matches any character.
        assert!(db.check_database_access(&alice, "test_db", true));
    }

    #[tokio::test]
    async fn version_starts_at_zero_and_snapshot_is_empty() {
        let mgr = manager();
        assert_eq!(mgr.version(), 0);
        assert!(mgr.snapshot().is_empty());
        assert!(mgr.can_update_immediately());
    }
}
