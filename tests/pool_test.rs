//! Integration tests for client pools.

mod common;

use common::{FakeLog, SharedLog, fake_client, fake_factory, settings, unique_name};
use sqlclient::db::ClientPool;
use sqlclient::sql_args;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pool(max: usize, min: usize) -> (Arc<ClientPool>, SharedLog) {
    let log = FakeLog::shared();
    let pool = ClientPool::with_factory(
        &unique_name("pool"),
        settings("pool_db"),
        max,
        min,
        fake_factory(&log),
    )
    .unwrap();
    (pool, log)
}

#[test]
fn test_checkout_is_exclusive() {
    let (pool, _) = pool(1, 1);
    let first = pool.provide_client_before(None).unwrap();
    assert!(first.is_in_pool());
    assert_eq!(pool.available_connections(), 0);

    let start = Instant::now();
    assert!(pool.provide_client_before(Some(Instant::now())).is_none());
    assert!(start.elapsed() < Duration::from_millis(500));

    drop(first);
    assert_eq!(pool.available_connections(), 1);
    assert!(pool.provide_client_before(Some(Instant::now())).is_some());

    let stats = pool.stats();
    assert_eq!((stats.immediate, stats.delayed, stats.failed), (2, 0, 1));
}

#[test]
fn test_waiting_checkout_is_delayed() {
    let (pool, _) = pool(1, 1);
    let held = pool.provide_client();
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        drop(held);
    });

    let client = pool.provide_client_before(Some(Instant::now() + Duration::from_secs(5)));
    assert!(client.is_some());
    releaser.join().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.delayed, 1);
    assert!(stats.longest_wait_ms >= 50);
}

#[test]
fn test_checkout_times_out() {
    let (pool, _) = pool(1, 1);
    let _held = pool.provide_client();
    let start = Instant::now();
    let err = pool.provide_client_within(Duration::from_millis(50)).unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(err.is_retryable());
    assert_eq!(pool.stats().failed, 1);
}

#[test]
fn test_unbounded_wait_checks_out() {
    let (pool, _) = pool(1, 1);
    let client = pool.provide_client_within(Duration::MAX).unwrap();
    assert!(client.is_in_pool());
    drop(client);
    assert_eq!(pool.available_connections(), 1);
}

#[test]
fn test_swallow_rejects_foreign_client() {
    let (pool, _) = pool(1, 1);
    let (outsider, _) = fake_client("pool_outsider");
    assert!(!pool.swallow_client(&outsider));

    let (other_pool, _) = self::pool(1, 1);
    let borrowed = other_pool.provide_client();
    assert!(!pool.swallow_client(&borrowed));
}

#[test]
fn test_resize_bounds() {
    let (pool, _) = pool(1, 1);
    assert!(pool.set_max_min(0, 0).unwrap_err().is_misuse());
    assert!(pool.set_max_min(101, 1).unwrap_err().is_misuse());
    assert!(pool.set_max_min(1, 2).unwrap_err().is_misuse());
    assert!(ClientPool::with_factory("bad", settings("db"), 2, 3, fake_factory(&FakeLog::shared())).is_err());

    pool.set_max_min(3, 2).unwrap();
    assert_eq!((pool.max_connections(), pool.min_connections()), (3, 2));

    let held: Vec<_> = (0..3).map(|_| pool.provide_client()).collect();
    assert!(pool.set_max_min(1, 1).unwrap_err().is_misuse());
    assert_eq!(pool.max_connections(), 3);
    drop(held);
    pool.set_max_min(1, 1).unwrap();
    assert_eq!(pool.max_connections(), 1);
}

#[test]
fn test_settings_fan_out() {
    let (pool, _) = pool(2, 1);
    pool.set_debugging(3);
    pool.set_duration_logging(Some(Duration::from_millis(10)));
    pool.set_max_min(3, 1).unwrap();

    let clients: Vec<_> = (0..3).map(|_| pool.provide_client()).collect();
    for client in &clients {
        assert_eq!(client.debugging(), 3);
        assert_eq!(client.duration_logging(), Some(Duration::from_millis(10)));
        assert!(Arc::ptr_eq(&client.cache(), &pool.cache()));
    }
}

#[test]
fn test_clients_share_cache() {
    let (pool, log) = pool(2, 1);
    let a = pool.provide_client();
    let b = pool.provide_client();
    assert!(!Arc::ptr_eq(&a, &b));
    a.cache_query(60, "SELECT n").unwrap();
    b.cache_query(60, "SELECT n").unwrap();
    assert_eq!(log.lock().queries.len(), 1);
}

#[test]
fn test_idle_clients_beyond_min_are_disconnected() {
    let (pool, log) = pool(3, 1);
    let held: Vec<_> = (0..3).map(|_| pool.provide_client()).collect();
    for client in &held {
        client.execute(&sql_args!["INSERT a"]).unwrap();
    }
    assert_eq!(pool.stats().connected, 3);

    drop(held);
    let stats = pool.stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.connected, 1);
    assert_eq!(log.lock().disconnects, 2);

    // A connected idle client is preferred.
    let again = pool.provide_client();
    assert!(again.is_connected());
}

#[test]
fn test_pool_proxies() {
    let (pool, log) = pool(2, 1);
    assert_eq!(pool.execute(&sql_args!["INSERT a"]).unwrap(), 1);
    let records = pool.query(&sql_args!["SELECT n"]).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(pool.cache_query(60, "SELECT n").unwrap().len(), 1);
    assert_eq!(pool.available_connections(), 2);
    assert_eq!(log.lock().committed, vec!["INSERT a"]);

    let report = pool.statistics();
    assert!(report.contains(pool.name()));
    assert!(report.contains("provided immediately: 3"));
}

#[test]
fn test_open_transaction_rolled_back_on_return() {
    let (pool, log) = pool(1, 1);
    let client = pool.provide_client();
    let scope = client.begin().unwrap();
    client.execute(&sql_args!["INSERT lost"]).unwrap();
    assert!(pool.swallow_client(&client));
    assert!(!client.is_in_transaction());
    drop(scope);
    drop(client);

    assert!(log.lock().committed.is_empty());
    assert_eq!(log.lock().rollbacks, 1);
}
