//! The filter chain between client and router.
//!
//! Filters see each routed statement on the way down and each reply on
//! the way back. A filter may pass the packet on (possibly rewritten),
//! or answer it directly, short-circuiting the router.

use bytes::Bytes;
use tracing::info;

use crate::backend::Reply;
use crate::config::FilterConfig;
use crate::parser::Classification;
use crate::protocol::{error_codes, ErrPacket};

use super::ReplyTrace;

/// What a filter decided to do with a downstream packet.
pub enum FilterAction {
    /// Continue down the chain with this payload.
    Pass(Bytes),
    /// Answer the client directly; the router never sees the packet.
    ShortCircuit(ErrPacket),
}

pub trait FilterSession: Send + Sync {
    /// Observe or rewrite a statement heading for the router.
    fn on_query(&mut self, payload: Bytes, classification: &Classification) -> FilterAction;

    /// Observe a reply heading back to the client.
    fn on_reply(&mut self, _reply: &Reply, _trace: &ReplyTrace) {}
}

/// Instantiate a service's filter chain for one session.
pub fn build_chain(configs: &[FilterConfig], session_id: u64) -> Vec<Box<dyn FilterSession>> {
    configs
        .iter()
        .map(|config| -> Box<dyn FilterSession> {
            match config {
                FilterConfig::QueryLog { log_replies } => Box::new(QueryLogFilter {
                    session_id,
                    log_replies: *log_replies,
                }),
                FilterConfig::Deny { patterns } => Box::new(DenyFilter {
                    patterns: patterns.clone(),
                }),
            }
        })
        .collect()
}

/// Logs every statement routed through the session.
struct QueryLogFilter {
    session_id: u64,
    log_replies: bool,
}

impl FilterSession for QueryLogFilter {
    fn on_query(&mut self, payload: Bytes, _classification: &Classification) -> FilterAction {
        if payload.first() == Some(&0x03) {
            let sql = String::from_utf8_lossy(&payload[1..]);
            info!(session_id = self.session_id, sql = %truncate(&sql, 1024), "query");
        }
        FilterAction::Pass(payload)
    }

    fn on_reply(&mut self, reply: &Reply, trace: &ReplyTrace) {
        if self.log_replies {
            info!(
                session_id = self.session_id,
                ok = reply.is_ok(),
                path = %trace,
                "reply"
            );
        }
    }
}

/// Rejects statements containing any configured substring.
struct DenyFilter {
    patterns: Vec<String>,
}

impl FilterSession for DenyFilter {
    fn on_query(&mut self, payload: Bytes, _classification: &Classification) -> FilterAction {
        if payload.first() == Some(&0x03) {
            let sql = String::from_utf8_lossy(&payload[1..]).to_lowercase();
            for pattern in &self.patterns {
                if sql.contains(&pattern.to_lowercase()) {
                    return FilterAction::ShortCircuit(ErrPacket::new(
                        error_codes::ER_ACCESS_DENIED_ERROR,
                        "HY000",
                        format!("Statement denied by filter (matched '{pattern}')"),
                    ));
                }
            }
        }
        FilterAction::Pass(payload)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Classifier;

    fn query_payload(sql: &str) -> Bytes {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        Bytes::from(payload)
    }

    #[test]
    fn deny_filter_short_circuits() {
        let configs = vec![FilterConfig::Deny {
            patterns: vec!["drop table".into()],
        }];
        let mut chain = build_chain(&configs, 1);
        let classification = Classifier::new().classify("DROP TABLE users");

        match chain[0].on_query(query_payload("DROP TABLE users"), &classification) {
            FilterAction::ShortCircuit(err) => {
                assert_eq!(err.error_code, error_codes::ER_ACCESS_DENIED_ERROR)
            }
            FilterAction::Pass(_) => panic!("expected short circuit"),
        }

        match chain[0].on_query(query_payload("SELECT 1"), &classification) {
            FilterAction::Pass(payload) => assert_eq!(payload, query_payload("SELECT 1")),
            FilterAction::ShortCircuit(_) => panic!("expected pass"),
        }
    }

    #[test]
    fn chain_order_matches_config() {
        let configs = vec![
            FilterConfig::QueryLog { log_replies: false },
            FilterConfig::Deny { patterns: vec![] },
        ];
        assert_eq!(build_chain(&configs, 1).len(), 2);
    }
}
