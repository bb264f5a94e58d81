//! Data models for the SQL client engine.
//!
//! This module re-exports the value and record types used throughout the crate.

pub mod record;
pub mod value;

// Re-export commonly used types
pub use record::{
    CountedSet, FieldNames, PairRecords, Record, RecordFactory, Records, ResultContainer,
    SingleValues, columns, singletons,
};
pub use value::{Arg, DATE_FORMAT, Value};
