//! Observer lists for asynchronous database events.

use crate::error::{SqlError, SqlResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An event delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Reference name of the client that received the event.
    pub client: String,
    pub name: String,
    /// True when the event was posted through the same connection.
    pub local: bool,
    pub payload: Option<String>,
}

pub type ObserverFn = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handle returned when registering an observer, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Check an event name and return its lowercased form.
///
/// Names must start with an ASCII letter followed by letters, digits or `_`.
pub fn validate_name(name: &str) -> SqlResult<String> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(SqlError::misuse(format!(
            "'{}' is not a valid notification name",
            name
        )));
    }
    Ok(name.to_ascii_lowercase())
}

#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    by_name: HashMap<String, Vec<(ObserverId, ObserverFn)>>,
}

impl Observers {
    /// Register `handler` for the (already validated) `name`.
    ///
    /// The flag is true when this is the first observer for the name.
    pub(crate) fn add(&mut self, name: &str, handler: ObserverFn) -> (ObserverId, bool) {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        let list = self.by_name.entry(name.to_string()).or_default();
        let first = list.is_empty();
        list.push((id, handler));
        (id, first)
    }

    /// Remove `id` from `name`, or from every name when `name` is `None`.
    ///
    /// Returns the names left without observers.
    pub(crate) fn remove(&mut self, id: ObserverId, name: Option<&str>) -> Vec<String> {
        let mut emptied = Vec::new();
        for (key, list) in self.by_name.iter_mut() {
            if name.is_some_and(|n| n != key.as_str()) {
                continue;
            }
            list.retain(|(observer, _)| *observer != id);
            if list.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in &emptied {
            self.by_name.remove(key);
        }
        emptied
    }

    pub(crate) fn handlers(&self, name: &str) -> Vec<ObserverFn> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.by_name.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}
