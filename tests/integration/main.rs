//! Integration test entry point
//!
//! These tests drive a running hermes instance with a live MariaDB/MySQL
//! backend behind it. Run with: HERMES_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod auth;
mod rw_split;
mod session_cmd;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HERMES_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip the current test unless integration testing is enabled.
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !$crate::should_run_integration_tests() {
            eprintln!("skipping: set HERMES_RUN_INTEGRATION_TESTS=1 to run");
            return;
        }
    };
}

/// Proxy endpoint configuration from environment
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    pub fn conn(&self) -> mysql::PooledConn {
        let pool = mysql::Pool::new(self.url().as_str()).expect("proxy should be reachable");
        pool.get_conn().expect("connection should succeed")
    }
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4006),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "hermes_test".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_else(|_| "hermes_test_pw".to_string()),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}
