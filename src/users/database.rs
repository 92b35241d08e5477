//! The immutable user database and its matching algorithm.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

use super::entry::{form_mapping_key, UserEntry};

pub type StringSet = BTreeSet<String>;
pub type StringSetMap = BTreeMap<String, StringSet>;

const INFORMATION_SCHEMA: &str = "information_schema";

/// How an entry's host pattern relates to a client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMatch {
    Match,
    NoMatch,
    /// The pattern can only be decided with a resolved client hostname.
    NeedHostname,
}

/// Shape of the client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrType {
    Ipv4,
    /// IPv4-mapped IPv6 (`::ffff:a.b.c.d`); also matched by its tail.
    Mapped,
    Ipv6,
    /// UNIX socket peers present themselves as "localhost".
    Localhost,
    Unknown,
}

/// Shape of an entry's host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternType {
    /// Address literal, possibly with LIKE wildcards.
    Address,
    /// `base/mask` for IPv4.
    Mask,
    /// A name: requires reverse resolution of the client address.
    Hostname,
    /// Wildcard pattern that could match either form.
    WildcardAddrOrName,
    Unknown,
}

/// Resolved (or failed) reverse lookup of the client address, threaded
/// through a lookup so one session resolves at most once.
#[derive(Debug, Clone, Default)]
pub struct ResolvedHostname {
    /// None = not attempted yet; Some(None) = attempted, failed.
    pub hostname: Option<Option<String>>,
}

impl ResolvedHostname {
    pub fn resolved(name: Option<String>) -> Self {
        Self {
            hostname: Some(name),
        }
    }
}

/// User account data published as one immutable snapshot. Lookups walk
/// the per-username entry lists in specificity order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UserDatabase {
    /// username -> entries ordered most-specific-first.
    users: BTreeMap<String, Vec<UserEntry>>,
    /// `user@host` -> databases; names may contain `%`/`_` wildcards.
    db_wildcard_grants: StringSetMap,
    /// `user@host` -> databases; literal names only.
    db_grants: StringSetMap,
    /// `user@host` -> granted roles.
    roles_mapping: StringSetMap,
    /// Existing database names.
    database_names: StringSet,
}

impl UserDatabase {
    /// Add an entry, keeping its username's list ordered. Returns false
    /// when the (username, host_pattern) pair already exists.
    pub fn add_entry(&mut self, entry: UserEntry) -> bool {
        let list = self.users.entry(entry.username.clone()).or_default();
        if list.iter().any(|e| e.host_pattern == entry.host_pattern) {
            return false;
        }
        let pos = list
            .binary_search_by(|e| e.host_pattern_is_more_specific(&entry))
            .unwrap_or_else(|p| p);
        list.insert(pos, entry);
        true
    }

    pub fn add_db_grants(&mut self, wildcard: StringSetMap, literal: StringSetMap) {
        merge_mapping(&mut self.db_wildcard_grants, wildcard);
        merge_mapping(&mut self.db_grants, literal);
    }

    pub fn add_db_wildcard_grant(&mut self, user: &str, host: &str, db: String) {
        self.db_wildcard_grants
            .entry(form_mapping_key(user, host))
            .or_default()
            .insert(db);
    }

    pub fn add_db_grant(&mut self, user: &str, host: &str, db: String) {
        self.db_grants
            .entry(form_mapping_key(user, host))
            .or_default()
            .insert(db);
    }

    pub fn add_role_mapping(&mut self, user: &str, host: &str, role: String) {
        self.roles_mapping
            .entry(form_mapping_key(user, host))
            .or_default()
            .insert(role);
    }

    pub fn add_database_name(&mut self, db: String) {
        self.database_names.insert(db);
    }

    pub fn set_proxy_priv(&mut self, user: &str, host: &str) {
        if let Some(list) = self.users.get_mut(user) {
            for entry in list.iter_mut() {
                if entry.host_pattern == host {
                    entry.proxy_priv = true;
                }
            }
        }
    }

    pub fn n_usernames(&self) -> usize {
        self.users.len()
    }

    pub fn n_entries(&self) -> usize {
        self.users.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Merge another database into this one (union-over-backends mode).
    /// Existing (user, host) entries win over merged ones.
    pub fn merge(&mut self, other: UserDatabase) {
        for (_, entries) in other.users {
            for entry in entries {
                self.add_entry(entry);
            }
        }
        merge_mapping(&mut self.db_wildcard_grants, other.db_wildcard_grants);
        merge_mapping(&mut self.db_grants, other.db_grants);
        merge_mapping(&mut self.roles_mapping, other.roles_mapping);
        self.database_names.extend(other.database_names);
    }

    /// Find the first entry for `username` whose host pattern matches the
    /// client address. `HostMatch::NeedHostname` propagates out when an
    /// entry would need the resolved client hostname to decide.
    pub fn find_entry(
        &self,
        username: &str,
        addr: &str,
        hostname: &ResolvedHostname,
        skip_name_resolve: bool,
    ) -> Result<Option<&UserEntry>, ()> {
        let Some(list) = self.users.get(username) else {
            return Ok(None);
        };

        let mut need_hostname = false;
        for entry in list {
            if entry.is_role {
                continue;
            }
            match self.address_matches_host_pattern(addr, hostname, skip_name_resolve, entry) {
                HostMatch::Match => return Ok(Some(entry)),
                HostMatch::NoMatch => {}
                HostMatch::NeedHostname => need_hostname = true,
            }
        }

        if need_hostname {
            // A later entry might match once the hostname is known, and
            // an earlier non-matching entry must not shadow it.
            Err(())
        } else {
            Ok(None)
        }
    }

    /// Find the first entry for `username` ignoring the client address.
    pub fn find_entry_any_host(&self, username: &str) -> Option<&UserEntry> {
        self.users
            .get(username)
            .and_then(|list| list.iter().find(|e| !e.is_role))
    }

    /// Exact (username, host pattern) lookup.
    pub fn find_entry_equal(&self, username: &str, host_pattern: &str) -> Option<&UserEntry> {
        self.users
            .get(username)?
            .iter()
            .find(|e| e.host_pattern == host_pattern)
    }

    pub fn check_database_exists(&self, db: &str, case_sensitive: bool) -> bool {
        if self.database_names.contains(db) {
            return true;
        }
        if !case_sensitive {
            return self
                .database_names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(db));
        }
        false
    }

    /// Can `entry` use `db`? Either directly, through a grant, or through
    /// its default role followed transitively.
    pub fn check_database_access(
        &self,
        entry: &UserEntry,
        db: &str,
        case_sensitive: bool,
    ) -> bool {
        if entry.global_db_priv {
            return true;
        }

        if self.key_can_access_db(&entry.mapping_key(), db, case_sensitive) {
            return true;
        }

        if !entry.default_role.is_empty() {
            let mut visited = HashSet::new();
            return self.role_can_access_db(&entry.default_role, db, case_sensitive, &mut visited);
        }

        false
    }

    fn key_can_access_db(&self, key: &str, db: &str, case_sensitive: bool) -> bool {
        if let Some(grants) = self.db_wildcard_grants.get(key) {
            for pattern in grants {
                if sql_like(pattern, db, !case_sensitive) {
                    return true;
                }
            }
        }
        if let Some(grants) = self.db_grants.get(key) {
            if grants.contains(db) {
                return true;
            }
            if !case_sensitive && grants.iter().any(|g| g.eq_ignore_ascii_case(db)) {
                return true;
            }
        }
        false
    }

    fn role_can_access_db(
        &self,
        role: &str,
        db: &str,
        case_sensitive: bool,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(role.to_string()) {
            return false;
        }

        // Role entries are stored with an empty host pattern.
        if let Some(role_entry) = self.find_entry_equal(role, "") {
            if role_entry.global_db_priv {
                return true;
            }
        }

        let key = form_mapping_key(role, "");
        if self.key_can_access_db(&key, db, case_sensitive) {
            return true;
        }

        if let Some(subroles) = self.roles_mapping.get(&key) {
            for sub in subroles {
                if self.role_can_access_db(sub, db, case_sensitive, visited) {
                    return true;
                }
            }
        }

        false
    }

    /// Is `db` exempt from grant checks?
    pub fn is_information_schema(db: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            db == INFORMATION_SCHEMA
        } else {
            db.eq_ignore_ascii_case(INFORMATION_SCHEMA)
        }
    }

    fn address_matches_host_pattern(
        &self,
        addr: &str,
        hostname: &ResolvedHostname,
        skip_name_resolve: bool,
        entry: &UserEntry,
    ) -> HostMatch {
        let addr_type = parse_address_type(addr);
        if addr_type == AddrType::Unknown {
            warn!(addr = %addr, "unsupported client address form");
            return HostMatch::NoMatch;
        }

        let pattern = &entry.host_pattern;
        let pattern_type = parse_pattern_type(pattern);

        match pattern_type {
            PatternType::Unknown => {
                warn!(
                    user = %entry.username,
                    pattern = %pattern,
                    "unsupported host pattern"
                );
                HostMatch::NoMatch
            }
            PatternType::Address => {
                if sql_like(pattern, addr, true) {
                    HostMatch::Match
                } else if addr_type == AddrType::Mapped && sql_like(pattern, ipv4_tail(addr), true)
                {
                    HostMatch::Match
                } else {
                    HostMatch::NoMatch
                }
            }
            PatternType::Mask => {
                let effective = match addr_type {
                    AddrType::Ipv4 => addr,
                    AddrType::Mapped => ipv4_tail(addr),
                    _ => return HostMatch::NoMatch,
                };
                if mask_matches(pattern, effective) {
                    HostMatch::Match
                } else {
                    HostMatch::NoMatch
                }
            }
            PatternType::Hostname => {
                match_hostname(pattern, hostname, skip_name_resolve)
            }
            PatternType::WildcardAddrOrName => {
                if addr_type == AddrType::Localhost {
                    if sql_like(pattern, addr, true) {
                        return HostMatch::Match;
                    }
                    return HostMatch::NoMatch;
                }
                if sql_like(pattern, addr, true) {
                    return HostMatch::Match;
                }
                if addr_type == AddrType::Mapped && sql_like(pattern, ipv4_tail(addr), true) {
                    return HostMatch::Match;
                }
                match_hostname(pattern, hostname, skip_name_resolve)
            }
        }
    }
}

fn match_hostname(
    pattern: &str,
    hostname: &ResolvedHostname,
    skip_name_resolve: bool,
) -> HostMatch {
    if skip_name_resolve {
        return HostMatch::NoMatch;
    }
    match &hostname.hostname {
        None => HostMatch::NeedHostname,
        Some(None) => HostMatch::NoMatch,
        Some(Some(name)) => {
            if sql_like(pattern, name, true) {
                HostMatch::Match
            } else {
                HostMatch::NoMatch
            }
        }
    }
}

fn merge_mapping(target: &mut StringSetMap, source: StringSetMap) {
    for (key, values) in source {
        target.entry(key).or_default().extend(values);
    }
}

/// The IPv4 part of an IPv4-mapped IPv6 address.
fn ipv4_tail(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(pos) => &addr[pos + 1..],
        None => addr,
    }
}

fn parse_address_type(addr: &str) -> AddrType {
    if addr.eq_ignore_ascii_case("localhost") {
        return AddrType::Localhost;
    }
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => AddrType::Ipv4,
        Ok(IpAddr::V6(v6)) => {
            if v6.to_ipv4_mapped().is_some() {
                AddrType::Mapped
            } else {
                AddrType::Ipv6
            }
        }
        Err(_) => AddrType::Unknown,
    }
}

fn parse_pattern_type(pattern: &str) -> PatternType {
    if pattern.is_empty() {
        return PatternType::Unknown;
    }

    // base/mask form.
    if let Some(slash) = pattern.find('/') {
        let (base, mask) = pattern.split_at(slash);
        if base.parse::<Ipv4Addr>().is_ok() && mask[1..].parse::<Ipv4Addr>().is_ok() {
            return PatternType::Mask;
        }
        return PatternType::Unknown;
    }

    let has_wildcards = pattern.contains('%') || pattern.contains('_');
    let addr_chars = pattern
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':' || c == '%' || c == '_');
    let leading_numeric = pattern
        .chars()
        .next()
        .map(|c| c.is_ascii_digit() || c == ':')
        .unwrap_or(false);

    if !has_wildcards {
        if pattern.parse::<IpAddr>().is_ok() {
            PatternType::Address
        } else {
            PatternType::Hostname
        }
    } else if addr_chars && leading_numeric {
        // Leading numeric-dot wildcard: address-only, no DNS needed.
        PatternType::Address
    } else {
        PatternType::WildcardAddrOrName
    }
}

/// `a.b.c.d/mask` check: client & mask == base.
fn mask_matches(pattern: &str, addr: &str) -> bool {
    let Some(slash) = pattern.find('/') else {
        return false;
    };
    let base: Ipv4Addr = match pattern[..slash].parse() {
        Ok(ip) => ip,
        Err(_) => return false,
    };
    let mask: Ipv4Addr = match pattern[slash + 1..].parse() {
        Ok(ip) => ip,
        Err(_) => return false,
    };
    let client: Ipv4Addr = match addr.parse() {
        Ok(ip) => ip,
        Err(_) => return false,
    };

    u32::from(client) & u32::from(mask) == u32::from(base)
}

/// SQL LIKE with `%`, `_` and `\` escape. Host and database patterns are
/// matched case-insensitively or sensitively per caller.
pub fn sql_like(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let pattern: Vec<char> = if case_insensitive {
        pattern.chars().flat_map(|c| c.to_lowercase()).collect()
    } else {
        pattern.chars().collect()
    };
    let text: Vec<char> = if case_insensitive {
        text.chars().flat_map(|c| c.to_lowercase()).collect()
    } else {
        text.chars().collect()
    };

    like_match(&pattern, &text)
}

fn like_match(pattern: &[char], text: &[char]) -> bool {
    // Iterative matcher with backtracking over the last `%`.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '%' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                '_' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, host: &str) -> UserEntry {
        UserEntry {
            username: user.into(),
            host_pattern: host.into(),
            ..UserEntry::default()
        }
    }

    fn no_hostname() -> ResolvedHostname {
        ResolvedHostname::default()
    }

    #[test]
    fn like_semantics() {
        assert!(sql_like("10.0.0.%", "10.0.0.55", true));
        assert!(!sql_like("10.0.0.%", "10.0.1.55", true));
        assert!(sql_like("app_.example.com", "app1.example.com", true));
        assert!(sql_like("%", "anything", true));
        assert!(sql_like("a\\%b", "a%b", true));
        assert!(!sql_like("a\\%b", "aXb", true));
        assert!(sql_like("SALES", "sales", true));
        assert!(!sql_like("SALES", "sales", false));
    }

    #[test]
    fn duplicate_user_host_rejected() {
        let mut db = UserDatabase::default();
        assert!(db.add_entry(entry("alice", "%")));
        assert!(!db.add_entry(entry("alice", "%")));
        assert_eq!(db.n_entries(), 1);
    }

    #[test]
    fn specificity_order_prefers_literal() {
        let mut db = UserDatabase::default();
        let mut wide = entry("alice", "%");
        wide.auth_plugin = "wide".into();
        let mut literal = entry("alice", "10.0.0.1");
        literal.auth_plugin = "literal".into();
        db.add_entry(wide);
        db.add_entry(literal);

        let found = db
            .find_entry("alice", "10.0.0.1", &no_hostname(), false)
            .unwrap()
            .unwrap();
        assert_eq!(found.auth_plugin, "literal");

        let found = db
            .find_entry("alice", "192.168.1.9", &no_hostname(), false)
            .unwrap()
            .unwrap();
        assert_eq!(found.auth_plugin, "wide");
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_pattern() {
        let mut db = UserDatabase::default();
        db.add_entry(entry("alice", "10.0.0.%"));
        let found = db
            .find_entry("alice", "::ffff:10.0.0.7", &no_hostname(), false)
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn mask_pattern() {
        let mut db = UserDatabase::default();
        db.add_entry(entry("alice", "10.0.0.0/255.255.255.0"));
        assert!(db
            .find_entry("alice", "10.0.0.200", &no_hostname(), false)
            .unwrap()
            .is_some());
        assert!(db
            .find_entry("alice", "10.0.1.200", &no_hostname(), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn hostname_pattern_requests_resolution() {
        let mut db = UserDatabase::default();
        db.add_entry(entry("alice", "app.example.com"));

        // Without a resolved name the lookup cannot decide.
        assert!(db
            .find_entry("alice", "10.0.0.5", &no_hostname(), false)
            .is_err());

        // With it, the pattern matches.
        let resolved = ResolvedHostname::resolved(Some("app.example.com".into()));
        assert!(db
            .find_entry("alice", "10.0.0.5", &resolved, false)
            .unwrap()
            .is_some());

        // A failed lookup means no match.
        let failed = ResolvedHostname::resolved(None);
        assert!(db
            .find_entry("alice", "10.0.0.5", &failed, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn skip_name_resolve_avoids_dns() {
        let mut db = UserDatabase::default();
        db.add_entry(entry("alice", "app.example.com"));
        assert!(db
            .find_entry("alice", "10.0.0.5", &no_hostname(), true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn numeric_wildcard_skips_dns() {
        let mut db = UserDatabase::default();
        db.add_entry(entry("alice", "10.0.%"));
        // An address-only wildcard never requests resolution.
        assert!(db
            .find_entry("alice", "192.168.0.1", &no_hostname(), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn role_entries_are_skipped() {
        let mut db = UserDatabase::default();
        let mut role = entry("ops", "");
        role.is_role = true;
        db.add_entry(role);
        assert!(db
            .find_entry("ops", "10.0.0.1", &no_hostname(), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn db_access_via_wildcard_grant() {
        let mut db = UserDatabase::default();
        db.add_entry(entry("alice", "%"));
        db.add_db_wildcard_grant("alice", "%", "sales\\_%".into());
        db.add_database_name("sales_eu".into());

        let e = db.find_entry_equal("alice", "%").unwrap().clone();
        assert!(db.check_database_access(&e, "sales_eu", true));
        assert!(!db.check_database_access(&e, "hr", true));
    }

    #[test]
    fn db_access_via_default_role_transitively() {
        let mut db = UserDatabase::default();
        let mut user = entry("alice", "%");
        user.default_role = "reader".into();
        db.add_entry(user);

        let mut reader = entry("reader", "");
        reader.is_role = true;
        db.add_entry(reader);
        let mut auditor = entry("auditor", "");
        auditor.is_role = true;
        db.add_entry(auditor);

        // reader -> auditor -> grant on `audit`.
        db.add_role_mapping("reader", "", "auditor".into());
        db.add_db_grant("auditor", "", "audit".into());

        let e = db.find_entry_equal("alice", "%").unwrap().clone();
        assert!(db.check_database_access(&e, "audit", true));
        assert!(!db.check_database_access(&e, "secrets", true));
    }

    #[test]
    fn role_cycles_terminate() {
        let mut db = UserDatabase::default();
        let mut user = entry("alice", "%");
        user.default_role = "a".into();
        db.add_entry(user);
        db.add_role_mapping("a", "", "b".into());
        db.add_role_mapping("b", "", "a".into());

        let e = db.find_entry_equal("alice", "%").unwrap().clone();
        assert!(!db.check_database_access(&e, "anything", true));
    }

    #[test]
    fn database_existence_case_modes() {
        let mut db = UserDatabase::default();
        db.add_database_name("Sales".into());
        assert!(db.check_database_exists("Sales", true));
        assert!(!db.check_database_exists("sales", true));
        assert!(db.check_database_exists("sales", false));
    }

    #[test]
    fn content_equality_detects_changes() {
        let mut a = UserDatabase::default();
        a.add_entry(entry("alice", "%"));
        let mut b = UserDatabase::default();
        b.add_entry(entry("alice", "%"));
        assert_eq!(a, b);

        b.add_database_name("sales".into());
        assert_ne!(a, b);
    }
}
