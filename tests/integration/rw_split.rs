//! Read/write split behavior through a live proxy.

use mysql::prelude::*;

use crate::{get_proxy_config, skip_if_not_enabled};

const TEST_TABLE: &str = "it_rw_probe";

fn setup_table(conn: &mut mysql::PooledConn) {
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS {TEST_TABLE} (id INT PRIMARY KEY, v VARCHAR(64))"
    ))
    .expect("create table should succeed");
    conn.query_drop(format!("DELETE FROM {TEST_TABLE}"))
        .expect("cleanup should succeed");
}

#[test]
fn test_reads_can_reach_replicas() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..20 {
        let server_id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT @@server_id should succeed");
        if let Some(id) = server_id {
            server_ids.insert(id);
        }
    }

    if server_ids.len() > 1 {
        eprintln!("read/write split observed: {} servers answered", server_ids.len());
    } else {
        eprintln!("single server answered (expected without replicas)");
    }
}

#[test]
fn test_writes_reach_the_master() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    setup_table(&mut conn);

    conn.query_drop(format!("INSERT INTO {TEST_TABLE} (id, v) VALUES (1, 'written')"))
        .expect("INSERT should succeed");

    let value: Option<String> = conn
        .query_first(format!("SELECT v FROM {TEST_TABLE} WHERE id = 1"))
        .expect("SELECT should succeed");
    assert_eq!(value.as_deref(), Some("written"));
}

#[test]
fn test_transaction_sticks_to_one_server() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    setup_table(&mut conn);

    conn.query_drop("START TRANSACTION").expect("BEGIN should succeed");
    conn.query_drop(format!("INSERT INTO {TEST_TABLE} (id, v) VALUES (2, 'trx')"))
        .expect("INSERT in transaction should succeed");

    // A read inside a read-write transaction must see the uncommitted row,
    // which only holds if it ran on the same (master) connection.
    let value: Option<String> = conn
        .query_first(format!("SELECT v FROM {TEST_TABLE} WHERE id = 2"))
        .expect("SELECT in transaction should succeed");
    assert_eq!(value.as_deref(), Some("trx"));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    let value: Option<String> = conn
        .query_first(format!("SELECT v FROM {TEST_TABLE} WHERE id = 2"))
        .expect("SELECT after rollback should succeed");
    assert_eq!(value, None);
}

#[test]
fn test_select_for_update_goes_to_master() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    setup_table(&mut conn);

    conn.query_drop(format!("INSERT INTO {TEST_TABLE} (id, v) VALUES (3, 'locked')"))
        .expect("INSERT should succeed");

    conn.query_drop("START TRANSACTION").expect("BEGIN should succeed");
    let value: Option<String> = conn
        .query_first(format!(
            "SELECT v FROM {TEST_TABLE} WHERE id = 3 FOR UPDATE"
        ))
        .expect("SELECT FOR UPDATE should succeed");
    assert_eq!(value.as_deref(), Some("locked"));
    conn.query_drop("COMMIT").expect("COMMIT should succeed");
}
