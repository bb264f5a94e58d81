//! SQLite backend over sqlx.
//!
//! The connection is driven through a private current-thread tokio runtime, so
//! the blocking [`Backend`] calls map one-to-one onto sqlx futures. Binary
//! values are written into statements as `X'..'` hex literals. SQLite has no
//! event transport, so listen/notify keep the default no-ops.

use crate::config::ClientSettings;
use crate::db::backend::{self, BINARY_MARKER, Backend, RowSink};
use crate::db::quote::Statement;
use crate::error::{SqlError, SqlResult};
use crate::models::{FieldNames, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

/// Database name that opens a private in-memory database.
pub const MEMORY_DATABASE: &str = ":memory:";

const HEX: &[u8; 16] = b"0123456789ABCDEF";

pub struct SqliteBackend {
    runtime: Runtime,
    conn: Option<SqliteConnection>,
}

impl SqliteBackend {
    pub fn new() -> SqlResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SqlError::internal(format!("failed to start SQLite runtime: {}", e)))?;
        Ok(Self {
            runtime,
            conn: None,
        })
    }

    fn options(database: &str) -> SqlResult<SqliteConnectOptions> {
        if database == MEMORY_DATABASE || database.is_empty() {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(SqlError::from)
        } else {
            Ok(SqliteConnectOptions::new()
                .filename(database)
                .create_if_missing(true))
        }
    }
}

fn not_open() -> SqlError {
    SqlError::connection("SQLite connection is not open", "Connect before use")
}

impl Backend for SqliteBackend {
    fn connect(&mut self, settings: &ClientSettings) -> SqlResult<()> {
        let options = Self::options(&settings.database)?;
        let conn = self
            .runtime
            .block_on(SqliteConnection::connect_with(&options))
            .map_err(|e| {
                SqlError::connection(
                    format!("cannot open SQLite database '{}': {}", settings.database, e),
                    "Check the database path and its permissions",
                )
            })?;
        debug!(database = %settings.database, "Opened SQLite database");
        self.conn = Some(conn);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.runtime.block_on(conn.close()) {
                warn!(error = %e, "Error closing SQLite connection");
            }
        }
    }

    fn execute(&mut self, statement: &Statement) -> SqlResult<i64> {
        let bytes = backend::insert_blobs(
            &*self,
            statement.text.as_bytes(),
            BINARY_MARKER,
            &statement.blobs,
        )?;
        let sql = String::from_utf8(bytes)
            .map_err(|e| SqlError::internal(format!("statement is not valid UTF-8: {}", e)))?;

        let conn = self.conn.as_mut().ok_or_else(not_open)?;
        let result = self.runtime.block_on(conn.execute(sql.as_str()))?;
        Ok(i64::try_from(result.rows_affected()).unwrap_or(i64::MAX))
    }

    fn query(&mut self, sql: &str, sink: &mut dyn RowSink) -> SqlResult<()> {
        let conn = self.conn.as_mut().ok_or_else(not_open)?;
        let rows = self.runtime.block_on(conn.fetch_all(sql))?;
        let Some(first) = rows.first() else {
            return Ok(());
        };

        let fields = Arc::new(FieldNames::new(
            first.columns().iter().map(|c| c.name().to_string()),
        )?);
        sink.reserve(rows.len());
        for row in &rows {
            let values = (0..fields.len()).map(|idx| decode_column(row, idx)).collect();
            sink.row(&fields, values)?;
        }
        Ok(())
    }

    fn length_of_escaped_binary(&self, data: &[u8]) -> usize {
        3 + 2 * data.len()
    }

    fn copy_escaped_binary(&self, data: &[u8], out: &mut Vec<u8>) -> usize {
        out.reserve(self.length_of_escaped_binary(data));
        out.extend_from_slice(b"X'");
        for byte in data {
            out.push(HEX[usize::from(byte >> 4)]);
            out.push(HEX[usize::from(byte & 0x0f)]);
        }
        out.push(b'\'');
        self.length_of_escaped_binary(data)
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// =============================================================================
// Value decoding
// =============================================================================

/// Storage class of a SQLite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageClass {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

fn storage_class(type_name: &str) -> StorageClass {
    let lower = type_name.to_lowercase();
    if lower == "null" {
        StorageClass::Null
    } else if lower.contains("int") || lower == "boolean" {
        StorageClass::Integer
    } else if lower == "real" || lower.contains("float") || lower.contains("double") {
        StorageClass::Real
    } else if lower.contains("blob") {
        StorageClass::Blob
    } else {
        StorageClass::Text
    }
}

/// Decode column `idx` by the storage class of the value itself.
fn decode_column(row: &SqliteRow, idx: usize) -> Value {
    let class = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => StorageClass::Null,
        Ok(raw) => storage_class(raw.type_info().name()),
        Err(e) => {
            warn!(column = idx, error = %e, "Failed to read SQLite column");
            return Value::Null;
        }
    };
    match class {
        StorageClass::Null => Value::Null,
        StorageClass::Integer => decode_integer(row, idx),
        StorageClass::Real => decode_float(row, idx),
        StorageClass::Blob => decode_blob(row, idx),
        StorageClass::Text => decode_text(row, idx),
    }
}

fn decode_integer(row: &SqliteRow, idx: usize) -> Value {
    match row.try_get::<Option<i64>, _>(idx) {
        Ok(v) => Value::from(v),
        Err(_) => decode_text(row, idx),
    }
}

fn decode_float(row: &SqliteRow, idx: usize) -> Value {
    match row.try_get::<Option<f64>, _>(idx) {
        Ok(v) => Value::from(v),
        Err(_) => decode_text(row, idx),
    }
}

fn decode_blob(row: &SqliteRow, idx: usize) -> Value {
    match row.try_get::<Option<Vec<u8>>, _>(idx) {
        Ok(v) => Value::from(v),
        Err(e) => {
            warn!(column = idx, error = %e, "Failed to decode SQLite blob");
            Value::Null
        }
    }
}

fn decode_text(row: &SqliteRow, idx: usize) -> Value {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(v) => Value::from(v),
        Err(_) => match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(bytes)) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(None) => Value::Null,
            Err(e) => {
                warn!(column = idx, error = %e, "Failed to decode SQLite text");
                Value::Null
            }
        },
    }
}
