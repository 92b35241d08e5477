mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Structural checks that must hold before anything is started.
    /// Cycle detection over the service graph happens when the graph is
    /// built; everything checked here is purely local.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("no services configured".into()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".into()));
        }

        let mut server_names = HashSet::new();
        for server in &self.servers {
            if !server_names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
            if server_names.contains(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "'{}' names both a service and a server",
                    service.name
                )));
            }
        }

        for service in &self.services {
            if service.targets.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' has no targets",
                    service.name
                )));
            }
            for target in &service.targets {
                if !server_names.contains(target.as_str())
                    && !service_names.contains(target.as_str())
                {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}' references unknown target '{}'",
                        service.name, target
                    )));
                }
            }
            if service.passthrough_auth && !self.auth.user_mapping.is_empty() {
                // Both features decide the backend credentials; accepting
                // the combination would silently ignore one of them.
                return Err(ConfigError::Invalid(format!(
                    "service '{}' enables passthrough_auth while user_mapping is configured",
                    service.name
                )));
            }
        }

        if let Some(name) = &self.listener.service {
            if !service_names.contains(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "listener references unknown service '{name}'"
                )));
            }
        }

        if self.listener.require_ssl
            && (self.listener.ssl_cert.is_none() || self.listener.ssl_key.is_none())
        {
            return Err(ConfigError::Invalid(
                "require_ssl is set but ssl_cert/ssl_key are missing".into(),
            ));
        }

        if self.listener.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }

        Ok(())
    }

    /// The service the listener hands new sessions to.
    pub fn listener_service(&self) -> &ServiceConfig {
        match &self.listener.service {
            Some(name) => self
                .services
                .iter()
                .find(|s| &s.name == name)
                .expect("validated at load"),
            None => &self.services[0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [listener]
            listen_addr = "127.0.0.1"
            listen_port = 4006

            [[services]]
            name = "split"
            user = "maxuser"
            password = "maxpwd"
            targets = ["db1", "db2"]

            [[servers]]
            name = "db1"
            host = "10.0.0.1"
            role = "master"

            [[servers]]
            name = "db2"
            host = "10.0.0.2"
        "#
    }

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.listener_service().name, "split");
        assert_eq!(config.servers[0].role, ServerRole::Master);
        assert_eq!(config.router.max_slave_connections, 255);
    }

    #[test]
    fn unknown_target_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.services[0].targets.push("nope".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn passthrough_with_mapping_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.services[0].passthrough_auth = true;
        config.auth.user_mapping.push(UserMapping {
            from_user: "app".into(),
            to_user: "backend_app".into(),
            to_password: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn require_ssl_needs_cert() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.listener.require_ssl = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn router_enums_parse() {
        let toml_snippet = r#"
            slave_selection_criteria = "adaptive_routing"
            causal_reads = "fast_global"
            master_failure_mode = "error_on_write"
        "#;
        let router: RouterConfig = toml::from_str(toml_snippet).unwrap();
        assert_eq!(
            router.slave_selection_criteria,
            SelectionCriteria::AdaptiveRouting
        );
        assert!(router.causal_reads.gates_on_gtid());
        assert_eq!(router.master_failure_mode, MasterFailureMode::ErrorOnWrite);
    }
}
