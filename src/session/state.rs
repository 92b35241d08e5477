//! Per-session state: identity, schema, transaction tracking and the
//! prepared-statement metadata table.

use std::collections::HashMap;

use bytes::Bytes;

use crate::auth::BackendCredentials;
use crate::parser::{Classification, SqlMode};
use crate::protocol::status_flags;
use crate::users::UserEntry;

/// Transaction tracking fed by OK-packet status flags.
#[derive(Debug, Clone, Default)]
pub struct TransactionTracker {
    pub active: bool,
    pub read_only: bool,
    /// COMMIT/ROLLBACK routed, reply not yet seen ("about to commit").
    pub ending: bool,
    pub autocommit: bool,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            autocommit: true,
            ..Self::default()
        }
    }

    pub fn update_from_status(&mut self, status: u16) {
        self.active = status & status_flags::SERVER_STATUS_IN_TRANS != 0;
        self.read_only = status & status_flags::SERVER_STATUS_IN_TRANS_READONLY != 0;
        if !self.active {
            self.ending = false;
        }
        self.autocommit = status & status_flags::SERVER_STATUS_AUTOCOMMIT != 0;
    }
}

/// Metadata kept per prepared statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub param_count: u16,
    /// Last two-byte-per-parameter type block seen in a COM_STMT_EXECUTE
    /// with the new-params-bound flag.
    pub type_block: Option<Bytes>,
    /// Routing classification of the prepared SQL.
    pub classification: Option<Classification>,
    /// Endpoint the last COM_STMT_EXECUTE ran on; cursors fetch there.
    pub last_endpoint: Option<usize>,
}

/// Staged credentials during COM_CHANGE_USER: committed on backend OK,
/// discarded on ERR.
#[derive(Debug, Clone)]
pub struct StagedAuth {
    pub entry: UserEntry,
    pub username: String,
    pub database: Option<String>,
    pub role: Option<String>,
    pub credentials: BackendCredentials,
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub username: String,
    /// Client address as the matching algorithm sees it (possibly from a
    /// PROXY header).
    pub client_addr: String,
    pub current_db: Option<String>,
    pub role: Option<String>,
    /// Speculative values awaiting a backend OK.
    pub pending_db: Option<String>,
    pub pending_role: Option<Option<String>>,
    /// Capabilities frozen at session start; never re-read afterwards.
    pub capabilities: u64,
    pub character_set: u8,
    pub sql_mode_oracle: bool,
    pub trx: TransactionTracker,
    pub prepared: HashMap<u32, PreparedStatement>,
    /// Credentials backend connections authenticate with.
    pub backend_credentials: Option<BackendCredentials>,
    /// The matched account entry.
    pub entry: Option<UserEntry>,
    pub staged_auth: Option<StagedAuth>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            trx: TransactionTracker::new(),
            ..Self::default()
        }
    }

    /// Commit a speculative database change after the backends agreed.
    pub fn commit_pending_db(&mut self) {
        if let Some(db) = self.pending_db.take() {
            self.current_db = Some(db);
        }
    }

    /// Commit a speculative role change after the backends agreed.
    pub fn commit_pending_role(&mut self) {
        if let Some(role) = self.pending_role.take() {
            self.role = role;
        }
    }

    pub fn discard_pending(&mut self) {
        self.pending_db = None;
        self.pending_role = None;
    }

    /// Apply a `SET sql_mode=...` observed locally.
    pub fn apply_sql_mode(&mut self, mode: SqlMode) {
        match mode {
            SqlMode::Oracle => self.sql_mode_oracle = true,
            SqlMode::Default => self.sql_mode_oracle = false,
            SqlMode::Other => {}
        }
    }

    /// Stage new authentication data during COM_CHANGE_USER.
    pub fn stage_auth(&mut self, staged: StagedAuth) {
        self.staged_auth = Some(staged);
    }

    /// Backend accepted the change: commit atomically.
    pub fn commit_staged_auth(&mut self) {
        if let Some(staged) = self.staged_auth.take() {
            self.username = staged.username;
            self.current_db = staged.database;
            self.role = staged.role;
            self.entry = Some(staged.entry);
            self.backend_credentials = Some(staged.credentials);
            self.prepared.clear();
        }
    }

    /// Backend refused: drop the staged data, prior auth stays intact.
    pub fn revert_staged_auth(&mut self) {
        self.staged_auth = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trx_follows_status_flags() {
        let mut trx = TransactionTracker::new();
        assert!(trx.autocommit);

        trx.update_from_status(
            status_flags::SERVER_STATUS_IN_TRANS | status_flags::SERVER_STATUS_AUTOCOMMIT,
        );
        assert!(trx.active);
        assert!(!trx.read_only);

        trx.ending = true;
        trx.update_from_status(status_flags::SERVER_STATUS_AUTOCOMMIT);
        assert!(!trx.active);
        assert!(!trx.ending);
    }

    #[test]
    fn pending_db_commit_and_discard() {
        let mut state = SessionState::new();
        state.pending_db = Some("sales".into());
        state.commit_pending_db();
        assert_eq!(state.current_db.as_deref(), Some("sales"));

        state.pending_db = Some("hr".into());
        state.discard_pending();
        state.commit_pending_db();
        assert_eq!(state.current_db.as_deref(), Some("sales"));
    }

    #[test]
    fn staged_auth_commit_and_revert() {
        let mut state = SessionState::new();
        state.username = "alice".into();
        state.current_db = Some("sales".into());

        let staged = StagedAuth {
            entry: UserEntry::default(),
            username: "carol".into(),
            database: Some("inventory".into()),
            role: None,
            credentials: BackendCredentials::Password {
                username: "carol".into(),
                password: "pw".into(),
            },
        };

        state.stage_auth(staged.clone());
        state.revert_staged_auth();
        assert_eq!(state.username, "alice");
        assert_eq!(state.current_db.as_deref(), Some("sales"));

        state.stage_auth(staged);
        state.commit_staged_auth();
        assert_eq!(state.username, "carol");
        assert_eq!(state.current_db.as_deref(), Some("inventory"));
    }
}
