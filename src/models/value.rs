//! Field values and statement arguments.
//!
//! `Value` is what a backend decodes out of a result row. `Arg` is what a caller
//! feeds into statement preparation: either a verbatim SQL fragment or a value
//! that has to be quoted (or, for binary data, carried out of band).

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

/// Text layout used when a date is quoted into a statement.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Date(DateTime<FixedOffset>),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Text form of the value, `None` for NULL.
    ///
    /// Binary data that is not valid UTF-8 is converted lossily.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
            Value::Binary(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Date(_) => "date",
            Value::Binary(_) => "binary",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            other => write!(f, "{}", other.to_text().unwrap_or_default()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Date(d) => serializer.serialize_str(&d.to_rfc3339()),
            Value::Binary(b) => serializer.serialize_str(&STANDARD.encode(b)),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

macro_rules! value_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Integer(i64::from(v))
                }
            }
        )*
    };
}

value_from_integer!(i8, i16, i32, i64, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v.fixed_offset())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One piece of a statement under preparation.
///
/// Plain strings become verbatim SQL; everything else is quoted. Wrap a
/// string in [`Arg::quoted`] to have it treated as a text literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// SQL text copied into the statement as is.
    Raw(String),
    /// A value quoted as a literal (binary values travel out of band).
    Value(Value),
    /// A parenthesised, comma separated list of quoted values.
    Set(Vec<Value>),
}

impl Arg {
    pub fn raw(sql: impl Into<String>) -> Self {
        Arg::Raw(sql.into())
    }

    pub fn quoted(value: impl Into<Value>) -> Self {
        Arg::Value(value.into())
    }

    pub fn set<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Arg::Set(values.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Raw(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Raw(v)
    }
}

impl From<&String> for Arg {
    fn from(v: &String) -> Self {
        Arg::Raw(v.clone())
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<Vec<Value>> for Arg {
    fn from(v: Vec<Value>) -> Self {
        Arg::Set(v)
    }
}

macro_rules! arg_from_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(v: $t) -> Self {
                    Arg::Value(Value::from(v))
                }
            }
        )*
    };
}

arg_from_value!(
    i8,
    i16,
    i32,
    i64,
    u16,
    u32,
    f32,
    f64,
    DateTime<FixedOffset>,
    DateTime<Utc>,
    Vec<u8>,
    &[u8]
);

impl<T: Into<Value>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        Arg::Value(Value::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_value_to_text() {
        assert_eq!(Value::Integer(42).to_text().as_deref(), Some("42"));
        assert_eq!(Value::Text("abc".into()).to_text().as_deref(), Some("abc"));
        assert_eq!(Value::Null.to_text(), None);
        assert_eq!(
            Value::Binary(b"hi".to_vec()).to_text().as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn test_value_numeric_accessors() {
        assert_eq!(Value::Text(" 12 ".into()).as_i64(), Some(12));
        assert_eq!(Value::Float(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float(3.5).as_i64(), None);
        assert_eq!(Value::Integer(2).as_f64(), Some(2.0));
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn test_value_serialize_binary_as_base64() {
        let json = serde_json::to_value(Value::Binary(vec![0, 1, 2])).unwrap();
        assert_eq!(json, serde_json::json!("AAEC"));
        assert_eq!(
            serde_json::to_value(Value::Null).unwrap(),
            serde_json::Value::Null
        );
    }

    #[test]
    fn test_date_text_format() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            Value::from(date).to_text().as_deref(),
            Some("2024-03-01 12:30:05.000 +0000")
        );
    }

    #[test]
    fn test_arg_conversions() {
        assert_eq!(Arg::from("SELECT 1"), Arg::Raw("SELECT 1".into()));
        assert_eq!(Arg::from(5i64), Arg::Value(Value::Integer(5)));
        assert_eq!(Arg::from(None::<i64>), Arg::Value(Value::Null));
        assert_eq!(
            Arg::quoted("O'Brien"),
            Arg::Value(Value::Text("O'Brien".into()))
        );
        assert_eq!(
            Arg::set([1i64, 2]),
            Arg::Set(vec![Value::Integer(1), Value::Integer(2)])
        );
    }
}
