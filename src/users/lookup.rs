//! The account search executed for every authentication attempt.

use crate::config::{DbNameCase, ListenerConfig};
use crate::protocol::DEFAULT_AUTH_PLUGIN;

use super::database::{ResolvedHostname, UserDatabase};
use super::entry::UserEntry;

/// Per-listener settings consulted during the search.
#[derive(Debug, Clone)]
pub struct UserSearchSettings {
    pub db_name_case: DbNameCase,
    pub match_host_pattern: bool,
    pub allow_anonymous_user: bool,
    pub allow_root_user: bool,
    pub skip_name_resolve: bool,
}

impl From<&ListenerConfig> for UserSearchSettings {
    fn from(listener: &ListenerConfig) -> Self {
        Self {
            db_name_case: listener.db_name_case,
            match_host_pattern: listener.match_host_pattern,
            allow_anonymous_user: listener.allow_anonymous_user,
            allow_root_user: listener.allow_root_user,
            skip_name_resolve: listener.skip_name_resolve,
        }
    }
}

/// Why a search concluded the way it did. Even failures carry an entry so
/// that a full token exchange can be performed before the error is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSearchOutcome {
    Ok,
    UserNotFound,
    DbAccessDenied,
    BadDb,
    RootAccessDenied,
    AnonProxyAccessDenied,
    PluginNotLoaded,
    /// A hostname-form entry might match; resolve the client address and
    /// retry the search.
    NeedNameinfo,
}

#[derive(Debug, Clone)]
pub struct UserSearchResult {
    pub outcome: UserSearchOutcome,
    pub entry: UserEntry,
}

impl UserSearchResult {
    fn not_found(user: &str) -> Self {
        Self {
            outcome: UserSearchOutcome::UserNotFound,
            entry: dummy_entry(user),
        }
    }
}

/// A synthetic placeholder so unknown users still get a plausible token
/// exchange (timing uniformity); authentication fails afterwards anyway.
fn dummy_entry(user: &str) -> UserEntry {
    UserEntry {
        username: user.to_string(),
        host_pattern: "%".to_string(),
        auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
        ..UserEntry::default()
    }
}

/// Search `db` for the entry applicable to `(user, addr, requested_db)`.
///
/// The first entry in specificity order whose host pattern matches the
/// client address wins. Database access is then checked through grants
/// and the default-role graph; anonymous fallback and root gating follow
/// the listener settings.
pub fn find_user(
    db: &UserDatabase,
    user: &str,
    addr: &str,
    requested_db: &str,
    settings: &UserSearchSettings,
    hostname: &ResolvedHostname,
) -> UserSearchResult {
    let (effective_db, case_sensitive) = match settings.db_name_case {
        DbNameCase::Sensitive => (requested_db.to_string(), true),
        DbNameCase::Lower => (requested_db.to_lowercase(), false),
        DbNameCase::Insensitive => (requested_db.to_string(), false),
    };

    let found = if settings.match_host_pattern {
        match db.find_entry(user, addr, hostname, settings.skip_name_resolve) {
            Ok(found) => found,
            Err(()) => {
                return UserSearchResult {
                    outcome: UserSearchOutcome::NeedNameinfo,
                    entry: dummy_entry(user),
                }
            }
        }
    } else {
        db.find_entry_any_host(user)
    };

    let mut result = match found {
        Some(entry) => {
            let mut outcome = UserSearchOutcome::Ok;
            if !effective_db.is_empty() {
                if !db.check_database_exists(&effective_db, case_sensitive) {
                    outcome = UserSearchOutcome::BadDb;
                } else if UserDatabase::is_information_schema(&effective_db, case_sensitive) {
                    // Always admitted.
                } else if !db.check_database_access(entry, &effective_db, case_sensitive) {
                    outcome = UserSearchOutcome::DbAccessDenied;
                }
            }
            UserSearchResult {
                outcome,
                entry: entry.clone(),
            }
        }
        None if settings.allow_anonymous_user => {
            // An anonymous entry has an empty username and matches any
            // client username, but must carry a proxy grant.
            let anon = if settings.match_host_pattern {
                match db.find_entry("", addr, hostname, settings.skip_name_resolve) {
                    Ok(found) => found,
                    Err(()) => {
                        return UserSearchResult {
                            outcome: UserSearchOutcome::NeedNameinfo,
                            entry: dummy_entry(user),
                        }
                    }
                }
            } else {
                db.find_entry_any_host("")
            };

            match anon {
                Some(entry) => {
                    let outcome = if !effective_db.is_empty()
                        && !db.check_database_exists(&effective_db, case_sensitive)
                    {
                        UserSearchOutcome::BadDb
                    } else if !entry.proxy_priv {
                        UserSearchOutcome::AnonProxyAccessDenied
                    } else {
                        UserSearchOutcome::Ok
                    };
                    UserSearchResult {
                        outcome,
                        entry: entry.clone(),
                    }
                }
                None => UserSearchResult::not_found(user),
            }
        }
        None => UserSearchResult::not_found(user),
    };

    if result.outcome == UserSearchOutcome::Ok && !settings.allow_root_user && user == "root" {
        result.outcome = UserSearchOutcome::RootAccessDenied;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> UserSearchSettings {
        UserSearchSettings {
            db_name_case: DbNameCase::Sensitive,
            match_host_pattern: true,
            allow_anonymous_user: false,
            allow_root_user: false,
            skip_name_resolve: false,
        }
    }

    fn db_with(entries: Vec<UserEntry>) -> UserDatabase {
        let mut db = UserDatabase::default();
        for e in entries {
            db.add_entry(e);
        }
        db
    }

    fn user(name: &str, host: &str) -> UserEntry {
        UserEntry {
            username: name.into(),
            host_pattern: host.into(),
            auth_plugin: DEFAULT_AUTH_PLUGIN.into(),
            ..UserEntry::default()
        }
    }

    #[test]
    fn match_without_db() {
        let db = db_with(vec![user("alice", "%")]);
        let res = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::Ok);
        assert_eq!(res.entry.username, "alice");
    }

    #[test]
    fn unknown_user_gets_placeholder() {
        let db = db_with(vec![]);
        let res = find_user(
            &db,
            "ghost",
            "10.0.0.1",
            "",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::UserNotFound);
        assert_eq!(res.entry.username, "ghost");
        assert_eq!(res.entry.host_pattern, "%");
        assert_eq!(res.entry.auth_plugin, DEFAULT_AUTH_PLUGIN);
    }

    #[test]
    fn bad_db_detected() {
        let db = db_with(vec![user("alice", "%")]);
        let res = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "nosuchdb",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::BadDb);
    }

    #[test]
    fn db_grant_required() {
        let mut db = db_with(vec![user("alice", "%")]);
        db.add_database_name("sales".into());
        db.add_database_name("hr".into());
        db.add_db_grant("alice", "%", "sales".into());

        let ok = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "sales",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(ok.outcome, UserSearchOutcome::Ok);

        let denied = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "hr",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(denied.outcome, UserSearchOutcome::DbAccessDenied);
    }

    #[test]
    fn information_schema_always_allowed() {
        let mut db = db_with(vec![user("alice", "%")]);
        db.add_database_name("information_schema".into());
        let res = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "information_schema",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::Ok);
    }

    #[test]
    fn lowercase_mode_folds_requested_db() {
        let mut db = db_with(vec![user("alice", "%")]);
        db.add_database_name("sales".into());
        db.add_db_grant("alice", "%", "sales".into());

        let mut sett = settings();
        sett.db_name_case = DbNameCase::Lower;
        let res = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "SALES",
            &sett,
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::Ok);
    }

    #[test]
    fn root_blocked_by_default() {
        let db = db_with(vec![user("root", "%")]);
        let res = find_user(
            &db,
            "root",
            "10.0.0.1",
            "",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::RootAccessDenied);

        let mut sett = settings();
        sett.allow_root_user = true;
        let res = find_user(&db, "root", "10.0.0.1", "", &sett, &ResolvedHostname::default());
        assert_eq!(res.outcome, UserSearchOutcome::Ok);
    }

    #[test]
    fn anonymous_fallback_requires_proxy_priv() {
        let mut plain_anon = user("", "%");
        plain_anon.proxy_priv = false;
        let db = db_with(vec![plain_anon]);

        let mut sett = settings();
        sett.allow_anonymous_user = true;

        let res = find_user(&db, "bob", "10.0.0.1", "", &sett, &ResolvedHostname::default());
        assert_eq!(res.outcome, UserSearchOutcome::AnonProxyAccessDenied);

        let mut proxy_anon = user("", "%");
        proxy_anon.proxy_priv = true;
        let db = db_with(vec![proxy_anon]);
        let res = find_user(&db, "bob", "10.0.0.1", "", &sett, &ResolvedHostname::default());
        assert_eq!(res.outcome, UserSearchOutcome::Ok);
    }

    #[test]
    fn hostname_entry_triggers_nameinfo() {
        let db = db_with(vec![user("alice", "app.example.com")]);
        let res = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "",
            &settings(),
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::NeedNameinfo);
    }

    #[test]
    fn host_matching_disabled_takes_first_entry() {
        let db = db_with(vec![user("alice", "10.99.99.99")]);
        let mut sett = settings();
        sett.match_host_pattern = false;
        let res = find_user(
            &db,
            "alice",
            "10.0.0.1",
            "",
            &sett,
            &ResolvedHostname::default(),
        );
        assert_eq!(res.outcome, UserSearchOutcome::Ok);
    }
}
