//! Literal quoting and statement preparation.
//!
//! Preparation concatenates verbatim fragments with quoted values. Binary
//! values are never quoted: each one is replaced by [`BINARY_MARKER_TEXT`] and
//! collected into [`Statement::blobs`] so the backend can splice the escaped
//! bytes in at execution time.

use crate::db::backend::BINARY_MARKER_TEXT;
use crate::error::{SqlError, SqlResult};
use crate::models::{Arg, DATE_FORMAT, Value};
use std::collections::HashMap;

/// Statement text plus the binary values referenced by its markers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Statement {
    pub text: String,
    pub blobs: Vec<Vec<u8>>,
}

impl Statement {
    /// A statement with no binary parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            blobs: Vec::new(),
        }
    }

    pub fn has_blobs(&self) -> bool {
        !self.blobs.is_empty()
    }
}

impl From<&str> for Statement {
    fn from(text: &str) -> Self {
        Statement::new(text)
    }
}

/// Standard SQL string literal: single quotes, embedded quotes doubled.
pub fn quote_string_default(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Quote a single value as SQL literal text.
///
/// `escape` is the backend's string quoting. Binary values cannot be quoted
/// inline and are rejected; use [`prepare`] for those.
pub fn quote_value(escape: &dyn Fn(&str) -> String, value: &Value) -> SqlResult<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Text(s) => Ok(escape(s)),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Float(f) if f.is_finite() => Ok(f.to_string()),
        Value::Float(f) => Err(SqlError::misuse(format!(
            "cannot quote non-finite number {}",
            f
        ))),
        Value::Date(d) => Ok(escape(&d.format(DATE_FORMAT).to_string())),
        Value::Binary(_) => Err(SqlError::misuse(
            "binary values are passed out of band; use statement preparation",
        )),
    }
}

/// Quote a list of values as `(a, b, c)`.
pub fn quote_set(escape: &dyn Fn(&str) -> String, values: &[Value]) -> SqlResult<String> {
    let parts = values
        .iter()
        .map(|v| quote_value(escape, v))
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(format!("({})", parts.join(", ")))
}

fn push_arg(
    escape: &dyn Fn(&str) -> String,
    arg: &Arg,
    text: &mut String,
    blobs: &mut Vec<Vec<u8>>,
) -> SqlResult<()> {
    match arg {
        Arg::Raw(sql) => text.push_str(sql),
        Arg::Value(Value::Binary(bytes)) => {
            text.push_str(BINARY_MARKER_TEXT);
            blobs.push(bytes.clone());
        }
        Arg::Value(value) => text.push_str(&quote_value(escape, value)?),
        Arg::Set(values) => text.push_str(&quote_set(escape, values)?),
    }
    Ok(())
}

/// Build a statement from verbatim fragments and quoted values.
pub fn prepare(escape: &dyn Fn(&str) -> String, args: &[Arg]) -> SqlResult<Statement> {
    let mut text = String::new();
    let mut blobs = Vec::new();
    for arg in args {
        push_arg(escape, arg, &mut text, &mut blobs)?;
    }
    Ok(Statement { text, blobs })
}

/// Expand `{key}` and `{key?default}` placeholders in `template`.
///
/// Values are substituted the same way [`prepare`] treats arguments. A
/// placeholder whose key is absent falls back to its literal default, or fails
/// when it has none. An unterminated `{` is copied through.
pub fn build_template(
    escape: &dyn Fn(&str) -> String,
    template: &str,
    values: &HashMap<String, Arg>,
) -> SqlResult<Statement> {
    let mut text = String::with_capacity(template.len());
    let mut blobs = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        text.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            text.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let inner = &after[..close];
        let (key, default) = match inner.split_once('?') {
            Some((k, d)) => (k, Some(d)),
            None => (inner, None),
        };
        match (values.get(key), default) {
            (Some(arg), _) => push_arg(escape, arg, &mut text, &mut blobs)?,
            (None, Some(d)) => text.push_str(d),
            (None, None) => {
                return Err(SqlError::misuse(format!(
                    "no value for template key '{}'",
                    key
                )));
            }
        }
        rest = &after[close + 1..];
    }
    text.push_str(rest);

    Ok(Statement { text, blobs })
}
