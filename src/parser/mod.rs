//! Statement classification.
//!
//! The router does not parse SQL; it only needs to know what kind of
//! operation a statement performs, which database it touches and whether
//! it must be replayed on fresh backend connections. Anything beyond that
//! stays inside the SQL dialect library.

use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

/// What a statement does, as far as routing is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// Plain read, eligible for replica routing.
    Read,
    /// Anything that may modify data. Routed to the master.
    Write,
    /// Session-affecting statement routed to every backend and recorded
    /// for replay (SET and friends).
    Session,
    Begin,
    Commit,
    Rollback,
    /// `USE <db>` in its textual form.
    Use(String),
    /// `SET ROLE <role>` or `SET ROLE NONE`.
    SetRole(Option<String>),
    SetAutocommit(bool),
    SetSqlMode(SqlMode),
    Kill(KillSpec),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlMode {
    Oracle,
    Default,
    Other,
}

/// Parsed `KILL` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSpec {
    /// None = unspecified, Some(true) = HARD, Some(false) = SOFT.
    pub hard: Option<bool>,
    pub kind: KillKind,
    pub target: KillTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillKind {
    #[default]
    Connection,
    Query,
    QueryId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Id(u64),
    User(String),
}

/// Classification result handed to the router.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: StatementKind,
    pub is_read_only: bool,
    /// Database the statement names explicitly, when determinable.
    pub touched_db: Option<String>,
}

impl Classification {
    fn of(kind: StatementKind, is_read_only: bool) -> Self {
        Self {
            kind,
            is_read_only,
            touched_db: None,
        }
    }

    /// Session commands are recorded in history and routed to all
    /// backends the session uses.
    pub fn is_session_command(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Session
                | StatementKind::SetRole(_)
                | StatementKind::SetAutocommit(_)
                | StatementKind::SetSqlMode(_)
        )
    }
}

/// Statement classifier. Wraps the SQL dialect library behind a single
/// `classify` call; fast paths for control statements skip the parser.
pub struct Classifier {
    dialect: MySqlDialect,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    pub fn classify(&self, sql: &str) -> Classification {
        let trimmed = sql.trim().trim_end_matches(';');
        let upper = trimmed.to_uppercase();

        // Control statements first; they are frequent and trivially
        // recognized without a full parse.
        if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
            return Classification::of(StatementKind::Begin, false);
        }
        if upper.starts_with("COMMIT") {
            return Classification::of(StatementKind::Commit, false);
        }
        if upper.starts_with("ROLLBACK") {
            return Classification::of(StatementKind::Rollback, false);
        }
        if upper.starts_with("KILL") {
            if let Some(spec) = parse_kill(trimmed) {
                return Classification::of(StatementKind::Kill(spec), false);
            }
            return Classification::of(StatementKind::Other, false);
        }
        if upper.starts_with("USE ") {
            let db = unquote(trimmed[4..].trim());
            let mut c = Classification::of(StatementKind::Use(db.clone()), false);
            c.touched_db = Some(db);
            return c;
        }
        if upper.starts_with("SET ") {
            return classify_set(trimmed, &upper);
        }

        match Parser::parse_sql(&self.dialect, trimmed) {
            Ok(statements) => match statements.first() {
                Some(stmt) => classify_statement(stmt),
                None => Classification::of(StatementKind::Other, false),
            },
            // An unparseable statement is routed as a write; the backend
            // produces the real error.
            Err(_) => Classification::of(StatementKind::Write, false),
        }
    }
}

fn classify_statement(stmt: &Statement) -> Classification {
    match stmt {
        Statement::Query(query) => {
            // SELECT ... FOR UPDATE/SHARE takes locks; treat as a write.
            let locking = !query.locks.is_empty();
            if locking {
                Classification::of(StatementKind::Write, false)
            } else {
                Classification::of(StatementKind::Read, true)
            }
        }
        Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ShowFunctions { .. }
        | Statement::Explain { .. }
        | Statement::ExplainTable { .. } => Classification::of(StatementKind::Read, true),
        Statement::Use { db_name } => {
            let db = db_name.value.clone();
            let mut c = Classification::of(StatementKind::Use(db.clone()), false);
            c.touched_db = Some(db);
            c
        }
        _ => Classification::of(StatementKind::Write, false),
    }
}

fn classify_set(trimmed: &str, upper: &str) -> Classification {
    let rest = trimmed[4..].trim();
    let rest_upper = &upper[4..].trim().to_string();

    if rest_upper.starts_with("ROLE") {
        let role = rest[4..].trim();
        let kind = if role.eq_ignore_ascii_case("NONE") {
            StatementKind::SetRole(None)
        } else {
            StatementKind::SetRole(Some(unquote(role)))
        };
        return Classification::of(kind, false);
    }

    if let Some(value) = set_value(rest, "AUTOCOMMIT") {
        let on = matches!(value.to_uppercase().as_str(), "1" | "ON" | "TRUE");
        return Classification::of(StatementKind::SetAutocommit(on), false);
    }

    if let Some(value) = set_value(rest, "SQL_MODE") {
        let mode = match value.to_uppercase().as_str() {
            "ORACLE" => SqlMode::Oracle,
            "DEFAULT" => SqlMode::Default,
            _ => SqlMode::Other,
        };
        return Classification::of(StatementKind::SetSqlMode(mode), false);
    }

    Classification::of(StatementKind::Session, false)
}

/// Extract the value of a `SET <name> = <value>` assignment, ignoring an
/// optional `SESSION`/`GLOBAL` scope and `@@` prefixes.
fn set_value<'a>(rest: &'a str, name: &str) -> Option<String> {
    let mut s = rest;
    for scope in ["SESSION ", "GLOBAL ", "LOCAL "] {
        if s.len() >= scope.len() && s[..scope.len()].eq_ignore_ascii_case(scope) {
            s = s[scope.len()..].trim_start();
        }
    }
    let s = s.trim_start_matches("@@").trim_start();
    let eq = s.find('=')?;
    let (key, value) = s.split_at(eq);
    if !key.trim().eq_ignore_ascii_case(name) {
        return None;
    }
    Some(unquote(value[1..].trim()))
}

/// Parse `KILL [HARD|SOFT] [CONNECTION|QUERY|QUERY ID] (<id> | USER <name>)`.
pub fn parse_kill(sql: &str) -> Option<KillSpec> {
    let mut tokens = sql.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("KILL") {
        return None;
    }

    let mut hard = None;
    let mut kind = KillKind::Connection;

    let mut next = tokens.next()?;

    if next.eq_ignore_ascii_case("HARD") {
        hard = Some(true);
        next = tokens.next()?;
    } else if next.eq_ignore_ascii_case("SOFT") {
        hard = Some(false);
        next = tokens.next()?;
    }

    if next.eq_ignore_ascii_case("CONNECTION") {
        kind = KillKind::Connection;
        next = tokens.next()?;
    } else if next.eq_ignore_ascii_case("QUERY") {
        kind = KillKind::Query;
        next = tokens.next()?;
        if next.eq_ignore_ascii_case("ID") {
            kind = KillKind::QueryId;
            next = tokens.next()?;
        }
    }

    let target = if next.eq_ignore_ascii_case("USER") {
        KillTarget::User(unquote(tokens.next()?))
    } else {
        KillTarget::Id(next.parse().ok()?)
    };

    if tokens.next().is_some() {
        return None;
    }

    Some(KillSpec { hard, kind, target })
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'')
            || (first == b'"' && last == b'"')
            || (first == b'`' && last == b'`')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> Classification {
        Classifier::new().classify(sql)
    }

    #[test]
    fn selects_are_reads() {
        let c = classify("SELECT * FROM orders WHERE id = 1");
        assert_eq!(c.kind, StatementKind::Read);
        assert!(c.is_read_only);
    }

    #[test]
    fn select_for_update_is_write() {
        let c = classify("SELECT * FROM orders WHERE id = 1 FOR UPDATE");
        assert_eq!(c.kind, StatementKind::Write);
    }

    #[test]
    fn inserts_are_writes() {
        let c = classify("INSERT INTO t (a) VALUES (1)");
        assert_eq!(c.kind, StatementKind::Write);
        assert!(!c.is_read_only);
    }

    #[test]
    fn transaction_control() {
        assert_eq!(classify("BEGIN").kind, StatementKind::Begin);
        assert_eq!(classify("START TRANSACTION").kind, StatementKind::Begin);
        assert_eq!(classify("commit").kind, StatementKind::Commit);
        assert_eq!(classify("ROLLBACK").kind, StatementKind::Rollback);
    }

    #[test]
    fn use_statement_carries_db() {
        let c = classify("USE `sales`");
        assert_eq!(c.kind, StatementKind::Use("sales".to_string()));
        assert_eq!(c.touched_db.as_deref(), Some("sales"));
    }

    #[test]
    fn set_role_variants() {
        assert_eq!(
            classify("SET ROLE accounting").kind,
            StatementKind::SetRole(Some("accounting".to_string()))
        );
        assert_eq!(classify("SET ROLE NONE").kind, StatementKind::SetRole(None));
    }

    #[test]
    fn set_autocommit() {
        assert_eq!(
            classify("SET autocommit=0").kind,
            StatementKind::SetAutocommit(false)
        );
        assert_eq!(
            classify("SET SESSION autocommit = ON").kind,
            StatementKind::SetAutocommit(true)
        );
    }

    #[test]
    fn set_sql_mode() {
        assert_eq!(
            classify("SET sql_mode=ORACLE").kind,
            StatementKind::SetSqlMode(SqlMode::Oracle)
        );
        assert_eq!(
            classify("SET sql_mode=DEFAULT").kind,
            StatementKind::SetSqlMode(SqlMode::Default)
        );
        assert_eq!(
            classify("SET sql_mode='STRICT_TRANS_TABLES'").kind,
            StatementKind::SetSqlMode(SqlMode::Other)
        );
    }

    #[test]
    fn generic_set_is_session_command() {
        let c = classify("SET @x = 1");
        assert_eq!(c.kind, StatementKind::Session);
        assert!(c.is_session_command());
    }

    #[test]
    fn kill_forms() {
        assert_eq!(
            parse_kill("KILL 7"),
            Some(KillSpec {
                hard: None,
                kind: KillKind::Connection,
                target: KillTarget::Id(7),
            })
        );
        assert_eq!(
            parse_kill("KILL HARD QUERY 12"),
            Some(KillSpec {
                hard: Some(true),
                kind: KillKind::Query,
                target: KillTarget::Id(12),
            })
        );
        assert_eq!(
            parse_kill("KILL QUERY ID 3"),
            Some(KillSpec {
                hard: None,
                kind: KillKind::QueryId,
                target: KillTarget::Id(3),
            })
        );
        assert_eq!(
            parse_kill("KILL SOFT USER 'app'"),
            Some(KillSpec {
                hard: Some(false),
                kind: KillKind::Connection,
                target: KillTarget::User("app".to_string()),
            })
        );
        assert_eq!(parse_kill("KILL"), None);
        assert_eq!(parse_kill("KILL 7 extra"), None);
    }

    #[test]
    fn unparseable_defaults_to_write() {
        let c = classify("FLUSH NO SUCH THING");
        assert_eq!(c.kind, StatementKind::Write);
    }
}
