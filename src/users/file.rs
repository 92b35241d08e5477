//! JSON user-accounts file.
//!
//! Three optional top-level arrays: `user`, `db` and `roles_mapping`.
//! Depending on configuration the file either supplements a successful
//! backend load or replaces backend fetching entirely.

use std::path::Path;

use serde::Deserialize;

use super::database::UserDatabase;
use super::entry::{strip_password_star, UserEntry};
use crate::protocol::DEFAULT_AUTH_PLUGIN;

#[derive(Debug, thiserror::Error)]
pub enum UsersFileError {
    #[error("failed to read users file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse users file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct UsersFile {
    #[serde(default)]
    user: Vec<FileUser>,
    #[serde(default)]
    db: Vec<FileDbGrant>,
    #[serde(default)]
    roles_mapping: Vec<FileRoleMapping>,
}

#[derive(Debug, Deserialize)]
struct FileUser {
    user: String,
    host: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    plugin: Option<String>,
    #[serde(default)]
    authentication_string: Option<String>,
    #[serde(default)]
    default_role: Option<String>,
    #[serde(default)]
    super_priv: Option<bool>,
    #[serde(default)]
    global_db_priv: Option<bool>,
    #[serde(default)]
    proxy_priv: Option<bool>,
    #[serde(default)]
    is_role: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileDbGrant {
    user: String,
    host: String,
    db: String,
}

#[derive(Debug, Deserialize)]
struct FileRoleMapping {
    user: String,
    host: String,
    role: String,
}

/// Load the file and apply its contents on top of `output`.
pub fn apply_users_file(path: &Path, output: &mut UserDatabase) -> Result<(), UsersFileError> {
    let content = std::fs::read_to_string(path)?;
    let file: UsersFile = serde_json::from_str(&content)?;

    for user in file.user {
        let password_hash = match (&user.password, &user.authentication_string) {
            (Some(pw), _) if !pw.is_empty() => strip_password_star(pw),
            (_, Some(auth)) => strip_password_star(auth),
            _ => String::new(),
        };

        output.add_entry(UserEntry {
            username: user.user,
            host_pattern: user.host,
            password_hash,
            auth_plugin: user
                .plugin
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_AUTH_PLUGIN.to_string()),
            is_role: user.is_role.unwrap_or(false),
            default_role: user.default_role.unwrap_or_default(),
            global_db_priv: user.global_db_priv.unwrap_or(false),
            super_priv: user.super_priv.unwrap_or(false),
            proxy_priv: user.proxy_priv.unwrap_or(false),
            ssl_required: false,
        });
    }

    for grant in file.db {
        // File grants are literal; wildcard grants only come from backends.
        output.add_db_grant(&grant.user, &grant.host, grant.db.clone());
        output.add_database_name(grant.db);
    }

    for mapping in file.roles_mapping {
        output.add_role_mapping(&mapping.user, &mapping.host, mapping.role);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_all_sections() {
        let file = write_file(
            r#"{
                "user": [
                    {"user": "alice", "host": "%", "password": "*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19"},
                    {"user": "reader", "host": "", "is_role": true, "global_db_priv": true}
                ],
                "db": [
                    {"user": "alice", "host": "%", "db": "sales"}
                ],
                "roles_mapping": [
                    {"user": "alice", "host": "%", "role": "reader"}
                ]
            }"#,
        );

        let mut db = UserDatabase::default();
        apply_users_file(file.path(), &mut db).unwrap();

        let alice = db.find_entry_equal("alice", "%").unwrap();
        // The hex convention's leading `*` is stripped.
        assert_eq!(
            alice.password_hash,
            "2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19"
        );
        assert_eq!(alice.auth_plugin, DEFAULT_AUTH_PLUGIN);

        let role = db.find_entry_equal("reader", "").unwrap();
        assert!(role.is_role);

        assert!(db.check_database_exists("sales", true));
    }

    #[test]
    fn empty_sections_are_fine() {
        let file = write_file("{}");
        let mut db = UserDatabase::default();
        apply_users_file(file.path(), &mut db).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let file = write_file("{not json");
        let mut db = UserDatabase::default();
        assert!(apply_users_file(file.path(), &mut db).is_err());
    }
}
