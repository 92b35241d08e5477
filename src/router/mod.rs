mod filter;
mod graph;
mod rwsplit;

pub use filter::{build_chain, FilterAction, FilterSession};
pub use graph::{RouteTarget, ServiceGraph, ServiceId, ServiceNode};
pub use rwsplit::{RouteDecision, RwSplitSession, WriteRouteError};

use std::fmt;

/// Severity of a backend failure reported up the component chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recoverable by reconnect + history replay; the client need not see it.
    Transient,
    /// The failing endpoint is gone; mask by rerouting or surface an ERR.
    Permanent,
}

/// The path a reply took back through the component graph: endpoint
/// identifiers, innermost first. Built like a cons list — each hop
/// prepends itself — so the router can attribute a response to a
/// specific backend without shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyTrace(Vec<String>);

impl ReplyTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(endpoint: impl Into<String>) -> Self {
        Self(vec![endpoint.into()])
    }

    /// Prepend the next hop on the way up.
    pub fn through(mut self, endpoint: impl Into<String>) -> Self {
        self.0.insert(0, endpoint.into());
        self
    }

    /// The endpoint that produced the reply.
    pub fn origin(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn hops(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ReplyTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("<-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_builds_inside_out() {
        let trace = ReplyTrace::single("db1").through("service-a");
        assert_eq!(trace.origin(), Some("db1"));
        assert_eq!(trace.to_string(), "service-a<-db1");
    }
}
