//! Session commands: user variables, USE, prepared statements.

use mysql::prelude::*;

use crate::{get_proxy_config, skip_if_not_enabled};

#[test]
fn test_user_variable_survives_read_routing() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    // SET is recorded and replayed; the variable must be visible on any
    // backend a later read lands on.
    conn.query_drop("SET @probe = 41").expect("SET should succeed");
    for _ in 0..10 {
        let value: Option<u64> = conn
            .query_first("SELECT @probe + 1")
            .expect("SELECT of the variable should succeed");
        assert_eq!(value, Some(42));
    }
}

#[test]
fn test_use_switches_schema_on_every_backend() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("USE information_schema")
        .expect("USE should succeed");
    for _ in 0..5 {
        let db: Option<String> = conn
            .query_first("SELECT DATABASE()")
            .expect("SELECT DATABASE() should succeed");
        assert_eq!(db.as_deref(), Some("information_schema"));
    }
}

#[test]
fn test_prepared_statement_roundtrip() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let stmt = conn
        .prep("SELECT ? + ?")
        .expect("PREPARE should succeed");
    for (a, b) in [(1u64, 2u64), (40, 2), (0, 0)] {
        let sum: Option<u64> = conn
            .exec_first(&stmt, (a, b))
            .expect("EXECUTE should succeed");
        assert_eq!(sum, Some(a + b));
    }
    conn.close(stmt).expect("CLOSE should succeed");
}

#[test]
fn test_closed_statement_is_gone() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let stmt = conn.prep("SELECT 7").expect("PREPARE should succeed");
    let value: Option<u64> = conn.exec_first(&stmt, ()).expect("EXECUTE should succeed");
    assert_eq!(value, Some(7));
    conn.close(stmt).expect("CLOSE should succeed");

    // The session must remain healthy after the close.
    let value: Option<u64> = conn.query_first("SELECT 8").expect("SELECT should succeed");
    assert_eq!(value, Some(8));
}
