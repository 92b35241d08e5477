//! User account entries and host-pattern ordering.

use serde::Deserialize;

/// One row of account data: a (username, host pattern) pair plus the
/// credential and privilege columns the proxy needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub host_pattern: String,
    /// Password hash, `SHA1(SHA1(password))` in hex without the leading `*`.
    pub password_hash: String,
    pub auth_plugin: String,
    pub is_role: bool,
    pub default_role: String,
    /// Set when the account has a global data privilege; database grants
    /// are then not consulted.
    pub global_db_priv: bool,
    pub super_priv: bool,
    pub proxy_priv: bool,
    pub ssl_required: bool,
}

impl UserEntry {
    /// Key into the grant and role maps.
    pub fn mapping_key(&self) -> String {
        form_mapping_key(&self.username, &self.host_pattern)
    }

    /// Order entries from most specific host pattern to least specific,
    /// so the first match wins. Literal patterns sort before wildcard
    /// ones; between wildcard patterns a longer literal prefix sorts
    /// first. Equal specificity falls back to the pattern text so the
    /// order is total and deterministic.
    pub fn host_pattern_is_more_specific(&self, other: &UserEntry) -> std::cmp::Ordering {
        let a = pattern_sort_key(&self.host_pattern);
        let b = pattern_sort_key(&other.host_pattern);
        a.cmp(&b)
            .then_with(|| self.host_pattern.cmp(&other.host_pattern))
    }
}

/// Build the `user@host` key used by grant and role maps.
pub fn form_mapping_key(user: &str, host_pattern: &str) -> String {
    format!("{user}@{host_pattern}")
}

/// (has wildcard, negated literal-prefix length): tuples compare so that
/// literals sort first and longer prefixes before shorter.
fn pattern_sort_key(pattern: &str) -> (bool, i64) {
    let prefix_len = pattern
        .find(|c| c == '%' || c == '_')
        .unwrap_or(pattern.len());
    let has_wildcard = prefix_len < pattern.len();
    (has_wildcard, -(prefix_len as i64))
}

/// Strip the `*` prefix of a MariaDB password hash, if present.
pub fn strip_password_star(hash: &str) -> String {
    hash.strip_prefix('*').unwrap_or(hash).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn entry(host: &str) -> UserEntry {
        UserEntry {
            username: "alice".into(),
            host_pattern: host.into(),
            ..UserEntry::default()
        }
    }

    #[test]
    fn literal_sorts_before_wildcard() {
        let literal = entry("10.0.0.1");
        let wildcard = entry("10.0.0.%");
        assert_eq!(
            literal.host_pattern_is_more_specific(&wildcard),
            Ordering::Less
        );
    }

    #[test]
    fn longer_prefix_sorts_first() {
        let narrow = entry("10.0.%");
        let wide = entry("10.%");
        assert_eq!(narrow.host_pattern_is_more_specific(&wide), Ordering::Less);
    }

    #[test]
    fn catch_all_sorts_last() {
        let mut entries = vec![entry("%"), entry("app.example.com"), entry("10.0.%")];
        entries.sort_by(|a, b| a.host_pattern_is_more_specific(b));
        assert_eq!(entries[0].host_pattern, "app.example.com");
        assert_eq!(entries[2].host_pattern, "%");
    }

    #[test]
    fn star_prefix_stripped() {
        assert_eq!(
            strip_password_star("*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19"),
            "2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19"
        );
        assert_eq!(strip_password_star("abc"), "abc");
    }

    #[test]
    fn mapping_key_format() {
        assert_eq!(entry("%").mapping_key(), "alice@%");
        assert_eq!(form_mapping_key("role_x", ""), "role_x@");
    }
}
