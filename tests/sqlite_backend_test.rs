//! End-to-end tests against SQLite databases in temporary directories.
#![cfg(feature = "sqlite")]

mod common;

use common::unique_name;
use sqlclient::config::{ReferenceConfig, SqlConfig};
use sqlclient::db::{Client, ClientPool, Statement};
use sqlclient::models::{Arg, Value};
use sqlclient::sql_args;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn config_for(reference: &str, path: &Path) -> SqlConfig {
    let mut references = HashMap::new();
    references.insert(
        reference.to_string(),
        ReferenceConfig {
            database: Some(path.display().to_string()),
            ..ReferenceConfig::default()
        },
    );
    SqlConfig {
        general: ReferenceConfig {
            server_type: Some("SQLite".to_string()),
            ..ReferenceConfig::default()
        },
        references,
        max_connections: Some(100),
        ..SqlConfig::default()
    }
}

fn open(dir: &TempDir, prefix: &str) -> (Arc<Client>, SqlConfig) {
    let name = unique_name(prefix);
    let config = config_for(&name, &dir.path().join("test.db"));
    let client = Client::open(&config, Some(&name)).unwrap();
    client
        .simple_execute(&Statement::new(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, data BLOB)",
        ))
        .unwrap();
    (client, config)
}

fn count(client: &Client) -> i64 {
    let record = client
        .query_record(&sql_args!["SELECT COUNT(*) AS n FROM items"])
        .unwrap();
    record.get("n").and_then(Value::as_i64).unwrap()
}

#[test]
fn test_data_persists_across_reconnect() {
    let dir = TempDir::new().unwrap();
    let (client, _) = open(&dir, "sqlite_persist");
    let n = client
        .execute(&sql_args!["INSERT INTO items (id, name) VALUES (1, ", Value::from("it's"), ")"])
        .unwrap();
    assert_eq!(n, 1);

    client.disconnect();
    assert!(!client.is_connected());
    assert_eq!(
        client
            .query_string(&sql_args!["SELECT name FROM items WHERE id = ", 1])
            .unwrap()
            .as_deref(),
        Some("it's")
    );
    assert!(dir.path().join("test.db").exists());
}

#[test]
fn test_blob_round_trip() {
    let dir = TempDir::new().unwrap();
    let (client, _) = open(&dir, "sqlite_blob");
    let blob: Vec<u8> = vec![0x00, 0xff, b'\'', 0x10];
    client
        .execute(&sql_args!["INSERT INTO items (id, data) VALUES (1, ", blob.clone(), ")"])
        .unwrap();

    let record = client
        .query_record(&sql_args!["SELECT data FROM items WHERE id = 1"])
        .unwrap();
    assert_eq!(record.get("data"), Some(&Value::Binary(blob)));
}

#[test]
fn test_rollback_discards_changes() {
    let dir = TempDir::new().unwrap();
    let (client, _) = open(&dir, "sqlite_rollback");
    {
        let scope = client.begin().unwrap();
        scope
            .client()
            .execute(&sql_args!["INSERT INTO items (id) VALUES (1)"])
            .unwrap();
        scope.rollback().unwrap();
    }
    assert_eq!(count(&client), 0);

    let scope = client.begin().unwrap();
    client.execute(&sql_args!["INSERT INTO items (id) VALUES (2)"]).unwrap();
    scope.commit().unwrap();
    assert_eq!(count(&client), 1);
}

#[test]
fn test_merged_inserts_and_batch_failures() {
    let dir = TempDir::new().unwrap();
    let (client, _) = open(&dir, "sqlite_merge");
    let mut tx = client.transaction();
    tx.set_merge(1);
    for id in 1..=5 {
        tx.add(&sql_args!["INSERT INTO items (id, name) VALUES (", id, ", ", Arg::quoted(format!("n{}", id)), ")"])
            .unwrap();
    }
    assert_eq!(tx.count(), 1);
    tx.execute().unwrap();
    assert_eq!(count(&client), 5);

    // Duplicate keys fail individually on retry.
    let mut batch = client.batch(false);
    for id in [5, 6, 1, 7] {
        batch
            .add(&sql_args!["INSERT INTO items (id) VALUES (", id, ")"])
            .unwrap();
    }
    let mut failures = client.transaction();
    let succeeded = batch
        .execute_batch_returning_failures(Some(&mut failures), false)
        .unwrap();
    assert_eq!(succeeded, 2);
    assert_eq!(
        failures.statements(),
        vec![
            "INSERT INTO items (id) VALUES (5)",
            "INSERT INTO items (id) VALUES (1)"
        ]
    );
    assert_eq!(count(&client), 7);
}

#[test]
fn test_statement_errors_carry_text() {
    let dir = TempDir::new().unwrap();
    let (client, _) = open(&dir, "sqlite_error");
    let err = client
        .execute(&sql_args!["INSERT INTO missing VALUES (1)"])
        .unwrap_err();
    assert_eq!(err.statement_text(), Some("INSERT INTO missing VALUES (1)"));
    assert!(client.is_connected());
}

#[test]
fn test_pool_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let (client, config) = open(&dir, "sqlite_pool");
    let pool = ClientPool::new(&config, Some(client.name()), 3, 1).unwrap();
    drop(client);

    let workers: Vec<_> = (0..3)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for i in 0..5 {
                    let id = worker * 100 + i;
                    pool.execute(&sql_args!["INSERT INTO items (id) VALUES (", id, ")"])
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let records = pool
        .query(&sql_args!["SELECT id FROM items ORDER BY id"])
        .unwrap();
    assert_eq!(records.len(), 15);
    assert_eq!(pool.stats().busy, 0);
}
