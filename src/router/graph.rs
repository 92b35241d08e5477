//! The static routing graph: services and the targets they route to.
//!
//! Services are arena nodes referencing their targets by index, so a
//! service can route into another service. The graph is validated
//! acyclic when built; sessions then walk it without any cycle checks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, ConfigError, ServiceConfig};
use crate::target::Server;

/// Index of a service node in the graph arena.
pub type ServiceId = usize;

/// A connectable target: a concrete server or another service.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Server(Arc<Server>),
    Service(ServiceId),
}

#[derive(Debug)]
pub struct ServiceNode {
    pub config: ServiceConfig,
    pub targets: Vec<RouteTarget>,
}

#[derive(Debug)]
pub struct ServiceGraph {
    nodes: Vec<ServiceNode>,
    by_name: HashMap<String, ServiceId>,
    servers: Vec<Arc<Server>>,
}

impl ServiceGraph {
    /// Build the graph from configuration, instantiating shared server
    /// objects and rejecting any edge that would create a cycle.
    pub fn build(config: &Config) -> Result<Self, ConfigError> {
        let servers: Vec<Arc<Server>> = config.servers.iter().map(Server::from_config).collect();
        let server_by_name: HashMap<&str, &Arc<Server>> =
            servers.iter().map(|s| (s.name(), s)).collect();

        let by_name: HashMap<String, ServiceId> = config
            .services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut nodes = Vec::with_capacity(config.services.len());
        for service in &config.services {
            let mut targets = Vec::with_capacity(service.targets.len());
            for target in &service.targets {
                if let Some(server) = server_by_name.get(target.as_str()) {
                    targets.push(RouteTarget::Server(Arc::clone(server)));
                } else if let Some(&id) = by_name.get(target) {
                    targets.push(RouteTarget::Service(id));
                } else {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}' references unknown target '{target}'",
                        service.name
                    )));
                }
            }
            nodes.push(ServiceNode {
                config: service.clone(),
                targets,
            });
        }

        let graph = Self {
            nodes,
            by_name,
            servers,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn service(&self, id: ServiceId) -> &ServiceNode {
        &self.nodes[id]
    }

    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// The concrete servers a service routes to, following nested
    /// services transitively. Order is first-seen; duplicates collapse.
    pub fn resolve_servers(&self, id: ServiceId) -> Vec<Arc<Server>> {
        let mut out: Vec<Arc<Server>> = Vec::new();
        let mut stack = vec![id];
        let mut seen_services = vec![false; self.nodes.len()];

        while let Some(service) = stack.pop() {
            if std::mem::replace(&mut seen_services[service], true) {
                continue;
            }
            for target in &self.nodes[service].targets {
                match target {
                    RouteTarget::Server(server) => {
                        if !out.iter().any(|s| Arc::ptr_eq(s, server)) {
                            out.push(Arc::clone(server));
                        }
                    }
                    RouteTarget::Service(nested) => stack.push(*nested),
                }
            }
        }
        out
    }

    /// DFS with colors; an edge back into the active stack is a cycle.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        fn visit(
            graph: &ServiceGraph,
            node: ServiceId,
            colors: &mut [Color],
        ) -> Result<(), ConfigError> {
            colors[node] = Color::Grey;
            for target in &graph.nodes[node].targets {
                if let RouteTarget::Service(next) = target {
                    match colors[*next] {
                        Color::Grey => {
                            return Err(ConfigError::Invalid(format!(
                                "service graph cycle through '{}'",
                                graph.nodes[*next].config.name
                            )))
                        }
                        Color::White => visit(graph, *next, colors)?,
                        Color::Black => {}
                    }
                }
            }
            colors[node] = Color::Black;
            Ok(())
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        for id in 0..self.nodes.len() {
            if colors[id] == Color::White {
                visit(self, id, &mut colors)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_services(services: &[(&str, &[&str])]) -> Config {
        let toml = format!(
            r#"
            [listener]
            listen_addr = "127.0.0.1"

            {}

            [[servers]]
            name = "db1"
            host = "10.0.0.1"
            role = "master"

            [[servers]]
            name = "db2"
            host = "10.0.0.2"
            "#,
            services
                .iter()
                .map(|(name, targets)| {
                    let targets = targets
                        .iter()
                        .map(|t| format!("\"{t}\""))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "[[services]]\nname = \"{name}\"\nuser = \"svc\"\npassword = \"pw\"\ntargets = [{targets}]\n"
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        );
        toml::from_str(&toml).unwrap()
    }

    #[test]
    fn builds_and_resolves_nested_services() {
        let config = config_with_services(&[
            ("outer", &["inner", "db1"]),
            ("inner", &["db2"]),
        ]);
        let graph = ServiceGraph::build(&config).unwrap();

        let outer = graph.service_id("outer").unwrap();
        let servers = graph.resolve_servers(outer);
        let names: Vec<&str> = servers.iter().map(|s| s.name()).collect();
        assert!(names.contains(&"db1"));
        assert!(names.contains(&"db2"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn cycle_rejected() {
        let config = config_with_services(&[
            ("a", &["b", "db1"]),
            ("b", &["c", "db2"]),
            ("c", &["a", "db1"]),
        ]);
        let err = ServiceGraph::build(&config).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_reference_rejected() {
        let config = config_with_services(&[("a", &["a", "db1"])]);
        assert!(ServiceGraph::build(&config).is_err());
    }

    #[test]
    fn duplicate_servers_collapse() {
        let config = config_with_services(&[
            ("outer", &["inner", "db2"]),
            ("inner", &["db2"]),
        ]);
        let graph = ServiceGraph::build(&config).unwrap();
        let outer = graph.service_id("outer").unwrap();
        assert_eq!(graph.resolve_servers(outer).len(), 1);
    }
}
