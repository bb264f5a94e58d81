//! SQL client engine library
//!
//! This library provides thread-safe named database clients over pluggable
//! backends, with result caching, batched and merged transactions, client
//! pools and a process-wide connection ceiling. A SQLite backend is built in.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{ClientSettings, SqlConfig};
pub use db::{CachePolicy, Client, ClientPool, Transaction};
pub use error::{SqlError, SqlResult};
pub use models::{Arg, Record, Value};
