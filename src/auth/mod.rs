//! Client and backend authentication.
//!
//! The protocol state machine frames packets; plugins own their payloads.
//! A successful client check yields [`BackendCredentials`] — either the
//! stage-1 hash recovered from the token exchange, or explicit
//! credentials selected through the user-mapping table.

mod native;

pub use native::{
    backend_token_from_sha1, check_token, hash_password, NATIVE_PASSWORD_PLUGIN, TokenCheck,
};

use crate::config::{AuthConfig, UserMapping};
use crate::protocol::{compute_auth_token, error_codes};
use crate::users::UserEntry;

/// Plugins the proxy can drive. Entries referencing anything else fail
/// authentication with "plugin is not loaded".
pub const SUPPORTED_PLUGINS: &[&str] = &[NATIVE_PASSWORD_PLUGIN];

pub fn plugin_supported(name: &str) -> bool {
    SUPPORTED_PLUGINS.contains(&name)
}

/// An authentication failure, carrying what the client should see.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    pub code: u16,
    pub sql_state: &'static str,
    pub message: String,
}

impl AuthError {
    pub fn access_denied(user: &str, host: &str, using_password: bool) -> Self {
        let pw = if using_password { "YES" } else { "NO" };
        Self {
            code: error_codes::ER_ACCESS_DENIED_ERROR,
            sql_state: "28000",
            message: format!("Access denied for user '{user}'@'{host}' (using password: {pw})"),
        }
    }

    pub fn db_access_denied(user: &str, host: &str, db: &str) -> Self {
        Self {
            code: error_codes::ER_DBACCESS_DENIED_ERROR,
            sql_state: "42000",
            message: format!("Access denied for user '{user}'@'{host}' to database '{db}'"),
        }
    }

    pub fn unknown_database(db: &str) -> Self {
        Self {
            code: error_codes::ER_BAD_DB_ERROR,
            sql_state: "42000",
            message: format!("Unknown database '{db}'"),
        }
    }

    pub fn plugin_not_loaded(plugin: &str) -> Self {
        Self {
            code: error_codes::ER_PLUGIN_IS_NOT_LOADED,
            sql_state: "HY000",
            message: format!("Plugin '{plugin}' is not loaded"),
        }
    }

    pub fn host_blocked(host: &str) -> Self {
        Self {
            code: error_codes::ER_HOST_NOT_PRIVILEGED,
            sql_state: "HY000",
            message: format!("Host '{host}' is blocked because of many connection errors"),
        }
    }

    pub fn ssl_required(user: &str, host: &str) -> Self {
        Self {
            code: error_codes::ER_ACCESS_DENIED_ERROR,
            sql_state: "28000",
            message: format!("Access denied for user '{user}'@'{host}' without SSL"),
        }
    }
}

/// Credentials a backend connection authenticates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCredentials {
    /// Recovered from the client's token exchange; no cleartext password
    /// ever exists in the proxy.
    Derived {
        username: String,
        sha1_password: Vec<u8>,
    },
    /// Explicit cleartext, from user mapping or the service account.
    Password { username: String, password: String },
}

impl BackendCredentials {
    pub fn username(&self) -> &str {
        match self {
            BackendCredentials::Derived { username, .. } => username,
            BackendCredentials::Password { username, .. } => username,
        }
    }

    /// Token for a given backend scramble.
    pub fn compute_token(&self, scramble: &[u8]) -> Vec<u8> {
        match self {
            BackendCredentials::Derived { sha1_password, .. } => {
                backend_token_from_sha1(sha1_password, scramble)
            }
            BackendCredentials::Password { password, .. } => {
                compute_auth_token(password, scramble)
            }
        }
    }

    /// Key for pooling: a pooled connection is only reused by sessions
    /// whose effective credentials match.
    pub fn pool_key(&self) -> String {
        match self {
            BackendCredentials::Derived {
                username,
                sha1_password,
            } => {
                use sha1::{Digest, Sha1};
                if sha1_password.is_empty() {
                    return format!("{username}\u{1f}");
                }
                let mut hasher = Sha1::new();
                hasher.update(sha1_password);
                let hex: String = hasher.finalize().iter().map(|b| format!("{b:02X}")).collect();
                format!("{username}\u{1f}{hex}")
            }
            BackendCredentials::Password { username, password } => {
                // Key on the double hash so derived and explicit forms of
                // the same account pool together.
                format!("{username}\u{1f}{}", hash_password(password))
            }
        }
    }
}

/// Select backend credentials after a successful client check, applying
/// the administratively configured user mapping.
pub fn select_backend_credentials(
    auth_config: &AuthConfig,
    client_user: &str,
    sha1_password: Vec<u8>,
) -> BackendCredentials {
    if let Some(mapping) = find_mapping(auth_config, client_user) {
        return BackendCredentials::Password {
            username: mapping.to_user.clone(),
            password: mapping.to_password.clone(),
        };
    }
    BackendCredentials::Derived {
        username: client_user.to_string(),
        sha1_password,
    }
}

fn find_mapping<'a>(config: &'a AuthConfig, user: &str) -> Option<&'a UserMapping> {
    config.user_mapping.iter().find(|m| m.from_user == user)
}

/// Verify a client token against a user entry with the entry's plugin.
pub fn verify_client_token(
    entry: &UserEntry,
    scramble: &[u8],
    token: &[u8],
) -> Result<TokenCheck, AuthError> {
    if !plugin_supported(&entry.auth_plugin) {
        return Err(AuthError::plugin_not_loaded(&entry.auth_plugin));
    }
    Ok(check_token(&entry.password_hash, scramble, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserMapping;
    use crate::protocol::SCRAMBLE_LEN;

    #[test]
    fn mapping_overrides_derived_credentials() {
        let config = AuthConfig {
            user_mapping: vec![UserMapping {
                from_user: "app".into(),
                to_user: "backend_app".into(),
                to_password: "secret".into(),
            }],
        };

        let mapped = select_backend_credentials(&config, "app", vec![1; 20]);
        assert_eq!(mapped.username(), "backend_app");

        let passthrough = select_backend_credentials(&config, "other", vec![1; 20]);
        assert_eq!(passthrough.username(), "other");
        assert!(matches!(passthrough, BackendCredentials::Derived { .. }));
    }

    #[test]
    fn derived_and_password_tokens_agree() {
        let scramble = [5u8; SCRAMBLE_LEN];
        let token = compute_auth_token("pw", &scramble);
        let stored = hash_password("pw");
        let TokenCheck::Ok { sha1_password } = check_token(&stored, &scramble, &token) else {
            panic!("check failed");
        };

        let derived = BackendCredentials::Derived {
            username: "u".into(),
            sha1_password,
        };
        let explicit = BackendCredentials::Password {
            username: "u".into(),
            password: "pw".into(),
        };

        let other_scramble = [8u8; SCRAMBLE_LEN];
        assert_eq!(
            derived.compute_token(&other_scramble),
            explicit.compute_token(&other_scramble)
        );
        assert_eq!(derived.pool_key(), explicit.pool_key());
    }

    #[test]
    fn unsupported_plugin_rejected() {
        let entry = UserEntry {
            auth_plugin: "ed25519".into(),
            ..UserEntry::default()
        };
        let err = verify_client_token(&entry, &[0; SCRAMBLE_LEN], &[]).unwrap_err();
        assert_eq!(err.code, error_codes::ER_PLUGIN_IS_NOT_LOADED);
    }
}
