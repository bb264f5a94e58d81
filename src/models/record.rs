//! Result rows and the pluggable constructors that build result sets.
//!
//! A backend decodes each row into a vector of [`Value`]s and hands it, together
//! with the shared [`FieldNames`] of the result set, to a [`RecordFactory`]. The
//! factory either produces an item for the [`ResultContainer`] or folds the row
//! into some accumulator of its own and produces nothing.

use crate::error::{SqlError, SqlResult};
use crate::models::Value;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered field names of a result set with a case-insensitive index.
///
/// Built once per result set and shared by every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNames {
    keys: Vec<String>,
    index: HashMap<String, usize>,
}

impl FieldNames {
    /// Build the key list, rejecting names that collide case-insensitively.
    pub fn new<I, S>(keys: I) -> SqlResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            if index.insert(key.to_lowercase(), i).is_some() {
                return Err(SqlError::misuse(format!(
                    "duplicate field name '{}' in record",
                    key
                )));
            }
        }
        Ok(Self { keys, index })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_at(&self, i: usize) -> Option<&str> {
        self.keys.get(i).map(String::as_str)
    }

    /// Position of `key`, compared case-insensitively.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(&key.to_lowercase()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// One result row: ordered (key, value) pairs.
///
/// The field count is fixed at construction. Values may be replaced in place;
/// the key set never changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Arc<FieldNames>,
    values: Vec<Value>,
}

impl Record {
    pub fn new(fields: Arc<FieldNames>, values: Vec<Value>) -> SqlResult<Self> {
        if fields.len() != values.len() {
            return Err(SqlError::misuse(format!(
                "record has {} keys but {} values",
                fields.len(),
                values.len()
            )));
        }
        Ok(Self { fields, values })
    }

    /// Build a record from parallel key and value lists.
    pub fn from_pairs<K: Into<String>>(keys: Vec<K>, values: Vec<Value>) -> SqlResult<Self> {
        Self::new(Arc::new(FieldNames::new(keys)?), values)
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fields(&self) -> &Arc<FieldNames> {
        &self.fields
    }

    pub fn key_at(&self, i: usize) -> Option<&str> {
        self.fields.key_at(i)
    }

    pub fn value_at(&self, i: usize) -> Option<&Value> {
        self.values.get(i)
    }

    /// Value for `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.position(key).and_then(|i| self.values.get(i))
    }

    /// Replace the value at `i`, returning the old one.
    pub fn replace(&mut self, i: usize, value: Value) -> SqlResult<Value> {
        let slot = self.values.get_mut(i).ok_or_else(|| {
            SqlError::misuse(format!("field index {} out of range ({})", i, self.fields.len()))
        })?;
        Ok(std::mem::replace(slot, value))
    }

    /// Replace the value of an existing field.
    pub fn set(&mut self, key: &str, value: Value) -> SqlResult<Value> {
        let i = self
            .fields
            .position(key)
            .ok_or_else(|| SqlError::misuse(format!("record has no field '{}'", key)))?;
        self.replace(i, value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Copy the record into a map keyed by lowercased field name.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Builds one result item per decoded row.
///
/// Returning `Ok(None)` means the row was absorbed elsewhere and nothing should
/// be inserted into the container.
pub trait RecordFactory {
    type Record;

    fn make_record(
        &mut self,
        fields: &Arc<FieldNames>,
        values: Vec<Value>,
    ) -> SqlResult<Option<Self::Record>>;
}

/// A collection rows are inserted into.
///
/// `duplicate` must produce an independent copy: the cache hands duplicates out
/// and keeps the master.
pub trait ResultContainer: Sized {
    type Item;

    fn with_capacity(capacity: usize) -> Self;
    fn insert(&mut self, item: Self::Item);
    fn duplicate(&self) -> Self;
}

impl<T: Clone> ResultContainer for Vec<T> {
    type Item = T;

    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }

    fn insert(&mut self, item: T) {
        self.push(item);
    }

    fn duplicate(&self) -> Self {
        self.clone()
    }
}

/// The default factory: one [`Record`] per row.
#[derive(Debug, Clone, Copy, Default)]
pub struct Records;

impl RecordFactory for Records {
    type Record = Record;

    fn make_record(
        &mut self,
        fields: &Arc<FieldNames>,
        values: Vec<Value>,
    ) -> SqlResult<Option<Record>> {
        Record::new(Arc::clone(fields), values).map(Some)
    }
}

/// Turns two-field rows into key/value pairs, for building a dictionary.
///
/// The key is the text of the first field; rows with a NULL key are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairRecords;

impl RecordFactory for PairRecords {
    type Record = (String, Value);

    fn make_record(
        &mut self,
        _fields: &Arc<FieldNames>,
        values: Vec<Value>,
    ) -> SqlResult<Option<(String, Value)>> {
        if values.len() != 2 {
            return Err(SqlError::misuse(format!(
                "dictionary query rows must have two fields, got {}",
                values.len()
            )));
        }
        let mut values = values.into_iter();
        let key = values.next().and_then(|k| k.to_text());
        let value = values.next().unwrap_or(Value::Null);
        Ok(key.map(|k| (k, value)))
    }
}

impl ResultContainer for HashMap<String, Value> {
    type Item = (String, Value);

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }

    fn insert(&mut self, (key, value): (String, Value)) {
        HashMap::insert(self, key, value);
    }

    fn duplicate(&self) -> Self {
        self.clone()
    }
}

/// Takes the single field of each row.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleValues;

impl RecordFactory for SingleValues {
    type Record = Value;

    fn make_record(
        &mut self,
        _fields: &Arc<FieldNames>,
        values: Vec<Value>,
    ) -> SqlResult<Option<Value>> {
        if values.len() != 1 {
            return Err(SqlError::misuse(format!(
                "singleton query rows must have one field, got {}",
                values.len()
            )));
        }
        Ok(values.into_iter().next())
    }
}

/// A multiset of values keyed by their text form, plus the number of values
/// added in total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountedSet {
    counts: HashMap<Option<String>, usize>,
    added: usize,
}

impl CountedSet {
    /// Number of times `value` was added.
    pub fn count_of(&self, value: &Value) -> usize {
        self.counts.get(&value.to_text()).copied().unwrap_or(0)
    }

    /// Total number of values added, duplicates included.
    pub fn added(&self) -> usize {
        self.added
    }

    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, usize)> {
        self.counts.iter().map(|(k, n)| (k.as_deref(), *n))
    }
}

impl ResultContainer for CountedSet {
    type Item = Value;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            counts: HashMap::with_capacity(capacity),
            added: 0,
        }
    }

    fn insert(&mut self, value: Value) {
        *self.counts.entry(value.to_text()).or_insert(0) += 1;
        self.added += 1;
    }

    fn duplicate(&self) -> Self {
        self.clone()
    }
}

/// Transpose records into one list of values per column.
///
/// The column layout is taken from the first record.
pub fn columns(records: &[Record]) -> Vec<Vec<Value>> {
    let Some(first) = records.first() else {
        return Vec::new();
    };
    (0..first.count())
        .map(|i| {
            records
                .iter()
                .map(|r| r.value_at(i).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect()
}

/// The first field of every record.
pub fn singletons(records: &[Record]) -> Vec<Value> {
    records
        .iter()
        .map(|r| r.value_at(0).cloned().unwrap_or(Value::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::from_pairs(
            vec!["Id", "Name"],
            vec![Value::Integer(1), Value::Text("alice".into())],
        )
        .unwrap()
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let record = sample();
        assert_eq!(record.get("id"), Some(&Value::Integer(1)));
        assert_eq!(record.get("NAME"), Some(&Value::Text("alice".into())));
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.key_at(1), Some("Name"));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let err = FieldNames::new(["a", "A"]).unwrap_err();
        assert!(err.is_misuse());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let fields = Arc::new(FieldNames::new(["a"]).unwrap());
        assert!(Record::new(fields, vec![]).is_err());
    }

    #[test]
    fn test_replace_keeps_field_count() {
        let mut record = sample();
        let old = record.set("name", Value::Text("bob".into())).unwrap();
        assert_eq!(old, Value::Text("alice".into()));
        assert_eq!(record.count(), 2);
        assert!(record.replace(5, Value::Null).is_err());
        assert!(record.set("nope", Value::Null).is_err());
    }

    #[test]
    fn test_to_map_lowercases_keys() {
        let map = sample().to_map();
        assert_eq!(map.get("id"), Some(&Value::Integer(1)));
        assert!(map.contains_key("name"));
    }

    #[test]
    fn test_record_serializes_as_object() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json, serde_json::json!({"Id": 1, "Name": "alice"}));
    }

    #[test]
    fn test_pair_records_into_map() {
        let fields = Arc::new(FieldNames::new(["k", "v"]).unwrap());
        let mut factory = PairRecords;
        let mut map = <HashMap<String, Value> as ResultContainer>::with_capacity(2);
        for (k, v) in [("a", 1), ("b", 2)] {
            let item = factory
                .make_record(&fields, vec![Value::from(k), Value::from(v)])
                .unwrap()
                .unwrap();
            ResultContainer::insert(&mut map, item);
        }
        assert_eq!(map.get("b"), Some(&Value::Integer(2)));

        let err = factory.make_record(&fields, vec![Value::Null]).unwrap_err();
        assert!(err.is_misuse());
    }

    #[test]
    fn test_counted_set() {
        let mut set = CountedSet::with_capacity(4);
        for v in ["x", "y", "x"] {
            set.insert(Value::from(v));
        }
        assert_eq!(set.count_of(&Value::from("x")), 2);
        assert_eq!(set.count_of(&Value::from("z")), 0);
        assert_eq!(set.added(), 3);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let original = vec![sample()];
        let mut copy = original.duplicate();
        copy[0].set("name", Value::Text("changed".into())).unwrap();
        assert_eq!(original[0].get("name"), Some(&Value::Text("alice".into())));
    }

    #[test]
    fn test_columns_and_singletons() {
        let records = vec![sample(), sample()];
        let cols = columns(&records);
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0], vec![Value::Integer(1), Value::Integer(1)]);
        assert_eq!(singletons(&records), vec![Value::Integer(1), Value::Integer(1)]);
        assert!(columns(&[]).is_empty());
    }
}
