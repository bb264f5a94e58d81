//! The connection ceiling is process-wide, so everything here runs as one
//! sequential test.

mod common;

use common::fake_client;
use sqlclient::db::governor;
use sqlclient::sql_args;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

fn pause() {
    std::thread::sleep(Duration::from_millis(10));
}

#[test]
fn test_connection_ceiling_and_registry() {
    let (a, _) = fake_client("gov_a");
    let (b, _) = fake_client("gov_b");
    let (c, log_c) = fake_client("gov_c");

    governor::set_max_connections(0);
    assert_eq!(governor::max_connections(), 1);
    governor::set_max_connections(2);

    // The longest-idle client makes room.
    a.connect().unwrap();
    pause();
    b.connect().unwrap();
    pause();
    c.connect().unwrap();
    assert!(!a.is_connected());
    assert!(b.is_connected() && c.is_connected());
    assert_eq!(governor::connected_count(), 2);

    // A client locked by another thread is skipped.
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let b = Arc::clone(&b);
        std::thread::spawn(move || {
            let _guard = b.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
    };
    locked_rx.recv().unwrap();
    a.connect().unwrap();
    assert!(b.is_connected());
    assert!(!c.is_connected());
    assert_eq!(log_c.lock().disconnects, 1);
    release_tx.send(()).unwrap();
    holder.join().unwrap();

    // Disconnected clients reconnect on demand.
    c.execute(&sql_args!["INSERT x"]).unwrap();
    assert!(c.is_connected());
    assert_eq!(governor::connected_count(), 2);

    // Purging by idle time.
    pause();
    let purged = governor::purge_connections(Some(Instant::now()));
    assert_eq!(purged, 2);
    assert_eq!(governor::connected_count(), 0);

    // Lowering the ceiling and purging without a cutoff.
    governor::set_max_connections(10);
    a.connect().unwrap();
    b.connect().unwrap();
    c.connect().unwrap();
    governor::set_max_connections(1);
    assert_eq!(governor::purge_connections(None), 2);
    assert_eq!(governor::connected_count(), 1);

    // Shutdown disconnects and forgets every client.
    let found = governor::existing_client(a.name()).unwrap();
    assert!(Arc::ptr_eq(&found, &a));
    drop(found);
    governor::shutdown();
    assert!(governor::existing_client(a.name()).is_none());
    assert!(governor::all_clients().is_empty());
    assert!(!a.is_connected() && !b.is_connected() && !c.is_connected());
}
