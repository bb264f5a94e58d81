//! Database access layer.
//!
//! This module provides the client engine:
//! - Backend capability trait and backend registry
//! - Statement quoting and template substitution
//! - Named clients with recursive locking and reconnect backoff
//! - Process-wide client registry and connection ceiling
//! - Query result cache with a background refresh worker
//! - Transactions, batches and statement merging
//! - Client pools
//! - SQLite backend over sqlx (feature `sqlite`)

pub mod backend;
pub mod cache;
pub mod client;
pub mod governor;
#[macro_use]
pub mod macros;
pub mod notify;
pub mod pool;
pub mod quote;
pub mod refresh;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod transaction;

pub use backend::{
    BINARY_MARKER, Backend, BackendFactory, BackendNotification, RowSink, register_backend,
};
pub use cache::{CachePolicy, CacheStats, QueryCache};
pub use client::{
    Client, ClientGuard, TransactionScope, backoff_delay, set_default_debugging,
    set_default_duration_logging,
};
pub use notify::{Notification, ObserverId};
pub use pool::{ClientPool, PoolStats, PooledClient};
pub use quote::Statement;
pub use refresh::RefreshWorker;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use transaction::Transaction;
