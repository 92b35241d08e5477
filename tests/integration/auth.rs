//! Handshake and authentication against a live proxy.

use mysql::prelude::*;

use crate::{get_proxy_config, skip_if_not_enabled};

#[test]
fn test_valid_credentials_connect() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let one: Option<u64> = conn.query_first("SELECT 1").expect("SELECT 1 should work");
    assert_eq!(one, Some(1));
}

#[test]
fn test_wrong_password_rejected() {
    skip_if_not_enabled!();

    let mut config = get_proxy_config();
    config.password = format!("{}_wrong", config.password);

    let err = mysql::Pool::new(config.url().as_str())
        .and_then(|p| p.get_conn())
        .expect_err("wrong password must not authenticate");
    let text = err.to_string();
    assert!(
        text.contains("Access denied") || text.contains("1045"),
        "unexpected error: {text}"
    );
}

#[test]
fn test_unknown_database_rejected() {
    skip_if_not_enabled!();

    let mut config = get_proxy_config();
    config.database = "no_such_database_xyz".to_string();

    let err = mysql::Pool::new(config.url().as_str())
        .and_then(|p| p.get_conn())
        .expect_err("unknown database must be rejected");
    let text = err.to_string();
    assert!(
        text.contains("Unknown database") || text.contains("1049") || text.contains("1044"),
        "unexpected error: {text}"
    );
}

#[test]
fn test_change_user_swaps_identity() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let before: Option<String> = conn
        .query_first("SELECT CURRENT_USER()")
        .expect("CURRENT_USER should work");
    assert!(before.is_some());

    // Reset back to the same credentials: exercises COM_CHANGE_USER
    // without needing a second account.
    conn.change_user(mysql::ChangeUserOpts::default())
        .expect("COM_CHANGE_USER with the same credentials should succeed");

    let after: Option<u64> = conn
        .query_first("SELECT 1")
        .expect("session should be usable after CHANGE_USER");
    assert_eq!(after, Some(1));
}
