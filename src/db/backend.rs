//! The capability set a database driver provides to the engine.
//!
//! A [`Backend`] does the wire I/O for one database engine: connecting,
//! executing statements, decoding rows into a [`RowSink`], escaping binary data
//! and (optionally) asynchronous event transport. Backends are created through
//! a static table of factories keyed by server type, so new engines are added
//! with [`register_backend`] rather than loaded at runtime.

use crate::config::ClientSettings;
use crate::db::quote::{self, Statement};
use crate::error::{SqlError, SqlResult};
use crate::models::{FieldNames, RecordFactory, ResultContainer, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Placeholder for an out-of-band binary value in prepared statement text.
pub const BINARY_MARKER_TEXT: &str = "'?'''?'";

/// [`BINARY_MARKER_TEXT`] as bytes, as searched for by [`insert_blobs`].
pub const BINARY_MARKER: &[u8] = BINARY_MARKER_TEXT.as_bytes();

/// An event delivered by the backend's notification transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendNotification {
    pub name: String,
    pub payload: Option<String>,
    /// True when the event was raised through this same connection.
    pub local: bool,
}

/// Receives decoded rows from [`Backend::query`].
pub trait RowSink {
    /// Called once before any row when the backend knows the row count.
    fn reserve(&mut self, _rows: usize) {}

    fn row(&mut self, fields: &Arc<FieldNames>, values: Vec<Value>) -> SqlResult<()>;
}

/// Driver for one database engine.
///
/// All methods are called with the owning client's lock held, so an
/// implementation never sees concurrent calls.
pub trait Backend: Send {
    /// Open the connection described by `settings`.
    fn connect(&mut self, settings: &ClientSettings) -> SqlResult<()>;

    /// Close the connection. Must be safe to call when not connected.
    fn disconnect(&mut self);

    /// Run a statement, returning the affected row count or -1 when unknown.
    ///
    /// Statements carrying blobs are expected to go through [`insert_blobs`].
    fn execute(&mut self, statement: &Statement) -> SqlResult<i64>;

    /// Run a query, feeding every row to `sink`.
    fn query(&mut self, sql: &str, sink: &mut dyn RowSink) -> SqlResult<()>;

    /// Length in bytes of `blob` once escaped for inclusion in statement text.
    fn length_of_escaped_binary(&self, blob: &[u8]) -> usize;

    /// Append the escaped form of `blob` to `out`, returning the bytes written.
    fn copy_escaped_binary(&self, blob: &[u8], out: &mut Vec<u8>) -> usize;

    /// Quote a string as a literal.
    fn quote_string(&self, s: &str) -> String {
        quote::quote_string_default(s)
    }

    fn begin(&mut self) -> SqlResult<()> {
        self.execute(&Statement::new("BEGIN")).map(|_| ())
    }

    fn commit(&mut self) -> SqlResult<()> {
        self.execute(&Statement::new("COMMIT")).map(|_| ())
    }

    fn rollback(&mut self) -> SqlResult<()> {
        self.execute(&Statement::new("ROLLBACK")).map(|_| ())
    }

    fn listen(&mut self, _name: &str) -> SqlResult<()> {
        Ok(())
    }

    fn unlisten(&mut self, _name: &str) -> SqlResult<()> {
        Ok(())
    }

    fn notify(&mut self, _name: &str, _payload: Option<&str>) -> SqlResult<()> {
        Ok(())
    }

    /// Drain events received since the last call.
    fn take_notifications(&mut self) -> Vec<BackendNotification> {
        Vec::new()
    }
}

/// Replace each marker in `text` with the escaped form of the matching blob.
///
/// Fails if the number of markers and blobs differ.
pub fn insert_blobs<B: Backend + ?Sized>(
    backend: &B,
    text: &[u8],
    marker: &[u8],
    blobs: &[Vec<u8>],
) -> SqlResult<Vec<u8>> {
    let positions = find_all(text, marker);
    if positions.len() != blobs.len() {
        return Err(SqlError::misuse(format!(
            "statement has {} binary markers but {} binary values",
            positions.len(),
            blobs.len()
        )));
    }

    let escaped_len: usize = blobs
        .iter()
        .map(|b| backend.length_of_escaped_binary(b))
        .sum();
    let mut out = Vec::with_capacity(text.len() + escaped_len);
    let mut start = 0;
    for (pos, blob) in positions.iter().zip(blobs) {
        out.extend_from_slice(&text[start..*pos]);
        backend.copy_escaped_binary(blob, &mut out);
        start = pos + marker.len();
    }
    out.extend_from_slice(&text[start..]);
    Ok(out)
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut found = Vec::new();
    if needle.is_empty() || haystack.len() < needle.len() {
        return found;
    }
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            found.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    found
}

/// Adapts a [`RecordFactory`] and [`ResultContainer`] pair to a [`RowSink`].
pub(crate) struct Collect<'a, F, C> {
    factory: &'a mut F,
    container: Option<C>,
}

impl<'a, F, C> Collect<'a, F, C>
where
    F: RecordFactory,
    C: ResultContainer<Item = F::Record>,
{
    pub(crate) fn new(factory: &'a mut F) -> Self {
        Self {
            factory,
            container: None,
        }
    }

    pub(crate) fn finish(self) -> C {
        self.container.unwrap_or_else(|| C::with_capacity(0))
    }
}

impl<F, C> RowSink for Collect<'_, F, C>
where
    F: RecordFactory,
    C: ResultContainer<Item = F::Record>,
{
    fn reserve(&mut self, rows: usize) {
        if self.container.is_none() {
            self.container = Some(C::with_capacity(rows));
        }
    }

    fn row(&mut self, fields: &Arc<FieldNames>, values: Vec<Value>) -> SqlResult<()> {
        let item = self.factory.make_record(fields, values)?;
        let container = self.container.get_or_insert_with(|| C::with_capacity(0));
        if let Some(item) = item {
            container.insert(item);
        }
        Ok(())
    }
}

/// Creates a backend for the given settings.
pub type BackendFactory =
    Arc<dyn Fn(&ClientSettings) -> SqlResult<Box<dyn Backend>> + Send + Sync>;

static BACKENDS: LazyLock<RwLock<HashMap<String, BackendFactory>>> = LazyLock::new(|| {
    #[allow(unused_mut)]
    let mut table: HashMap<String, BackendFactory> = HashMap::new();
    #[cfg(feature = "sqlite")]
    {
        let sqlite: BackendFactory = Arc::new(|_settings: &ClientSettings| {
            Ok(Box::new(crate::db::sqlite::SqliteBackend::new()?) as Box<dyn Backend>)
        });
        table.insert("sqlite".to_string(), sqlite);
    }
    RwLock::new(table)
});

/// Register (or replace) the factory for `server_type`.
///
/// Server types are matched case-insensitively.
pub fn register_backend<F>(server_type: &str, factory: F)
where
    F: Fn(&ClientSettings) -> SqlResult<Box<dyn Backend>> + Send + Sync + 'static,
{
    BACKENDS
        .write()
        .insert(server_type.to_lowercase(), Arc::new(factory));
}

/// Look up the factory registered for `server_type`.
pub fn backend_factory(server_type: &str) -> SqlResult<BackendFactory> {
    BACKENDS
        .read()
        .get(&server_type.to_lowercase())
        .cloned()
        .ok_or_else(|| {
            SqlError::config(format!(
                "no backend registered for server type '{}'",
                server_type
            ))
        })
}

/// Create a backend for `settings.server_type`.
pub fn create_backend(settings: &ClientSettings) -> SqlResult<Box<dyn Backend>> {
    let factory = backend_factory(&settings.server_type)?;
    factory(settings)
}

/// Server types with a registered factory.
pub fn registered_backends() -> Vec<String> {
    let mut names: Vec<String> = BACKENDS.read().keys().cloned().collect();
    names.sort();
    names
}
