//! Ordered statement lists executed atomically on one client.
//!
//! A [`Transaction`] collects statements (and nested transactions) and runs
//! them between `BEGIN` and `COMMIT`. In batch mode a failing transaction is
//! retried entry by entry so that the statements that can succeed do, and the
//! rest are reported back. With merging enabled, compatible INSERT, UPDATE and
//! DELETE statements are folded into earlier entries as they are added.

use crate::db::client::Client;
use crate::db::quote::Statement;
use crate::error::{SqlError, SqlResult};
use crate::models::Arg;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
enum Entry {
    Statement {
        statement: Statement,
        /// Number of statements folded into this one.
        count: usize,
        merged_or: bool,
    },
    Nested(Transaction),
}

impl Entry {
    fn count(&self) -> usize {
        match self {
            Entry::Statement { count, .. } => *count,
            Entry::Nested(t) => t.total_count(),
        }
    }
}

#[derive(Clone)]
pub struct Transaction {
    client: Arc<Client>,
    entries: Vec<Entry>,
    batch: bool,
    stop_on_failure: bool,
    merge: u8,
}

impl Transaction {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            entries: Vec::new(),
            batch: false,
            stop_on_failure: true,
            merge: 0,
        }
    }

    pub fn new_batch(client: Arc<Client>, stop_on_failure: bool) -> Self {
        Self {
            batch: true,
            stop_on_failure,
            ..Self::new(client)
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }

    /// Number of entries (merged statements count once).
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of statements added, counting merged and nested ones.
    pub fn total_count(&self) -> usize {
        self.entries.iter().map(Entry::count).sum()
    }

    pub fn merge(&self) -> u8 {
        self.merge
    }

    /// Set how many recent entries a new statement may merge into; 0 turns
    /// merging off. Returns the previous setting.
    ///
    /// Merging changes execution order, so only enable it where that is
    /// acceptable.
    pub fn set_merge(&mut self, history: u8) -> u8 {
        std::mem::replace(&mut self.merge, history)
    }

    /// Remove every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Prepare `args` on the client and add the statement.
    pub fn add(&mut self, args: &[Arg]) -> SqlResult<()> {
        let statement = self.client.prepare(args)?;
        self.add_prepared(statement);
        Ok(())
    }

    /// Expand `template` on the client and add the statement.
    pub fn add_with(&mut self, template: &str, values: &HashMap<String, Arg>) -> SqlResult<()> {
        let statement = self.client.build_query_with(template, values)?;
        self.add_prepared(statement);
        Ok(())
    }

    /// Add a statement, merging it into a recent entry when possible.
    pub fn add_prepared(&mut self, statement: Statement) {
        if self.merge > 0 && self.try_merge(&statement) {
            return;
        }
        self.entries.push(Entry::Statement {
            statement,
            count: 1,
            merged_or: false,
        });
    }

    fn try_merge(&mut self, statement: &Statement) -> bool {
        let Some(shape) = MergeShape::of(&statement.text) else {
            return false;
        };
        if shape.kind != MergeKind::Insert && statement.has_blobs() {
            return false;
        }
        let (prefix, tail) = shape.split(&statement.text);

        let history = usize::from(self.merge);
        for entry in self.entries.iter_mut().rev().take(history) {
            let Entry::Statement {
                statement: existing,
                count,
                merged_or,
            } = entry
            else {
                continue;
            };
            if shape.kind != MergeKind::Insert && existing.has_blobs() {
                continue;
            }
            let Some(existing_shape) = MergeShape::of(&existing.text) else {
                continue;
            };
            if existing_shape.kind != shape.kind {
                continue;
            }
            let (existing_prefix, existing_tail) = existing_shape.split(&existing.text);
            if existing_prefix != prefix {
                continue;
            }

            let text = match shape.kind {
                MergeKind::Insert => format!("{} {}, {}", prefix, existing_tail, tail),
                MergeKind::Condition if *merged_or => {
                    format!("{} {} OR ({})", prefix, existing_tail, tail)
                }
                MergeKind::Condition => {
                    format!("{} ({}) OR ({})", prefix, existing_tail, tail)
                }
            };
            existing.text = text;
            existing.blobs.extend(statement.blobs.iter().cloned());
            *count += 1;
            if shape.kind == MergeKind::Condition {
                *merged_or = true;
            }
            debug!(merged = *count, prefix = %prefix, "Merged statement into transaction entry");
            return true;
        }
        false
    }

    fn check_client(&self, other: &Transaction) -> SqlResult<()> {
        if Arc::ptr_eq(&self.client, &other.client) || *self.client == *other.client {
            Ok(())
        } else {
            Err(SqlError::misuse(format!(
                "transaction for '{}' cannot be combined with one for '{}'",
                other.client.name(),
                self.client.name()
            )))
        }
    }

    /// Add a copy of `other` as a nested entry. Empty transactions are ignored.
    pub fn append(&mut self, other: &Transaction) -> SqlResult<()> {
        self.check_client(other)?;
        if !other.is_empty() {
            self.entries.push(Entry::Nested(other.clone()));
        }
        Ok(())
    }

    /// Insert a copy of `other` as a nested entry at `index`.
    pub fn insert_transaction(&mut self, other: &Transaction, index: usize) -> SqlResult<()> {
        self.check_client(other)?;
        if index > self.entries.len() {
            return Err(SqlError::misuse(format!(
                "index {} out of range for transaction with {} entries",
                index,
                self.entries.len()
            )));
        }
        if !other.is_empty() {
            self.entries.insert(index, Entry::Nested(other.clone()));
        }
        Ok(())
    }

    /// Remove the entry at `index`.
    pub fn remove_transaction_at(&mut self, index: usize) -> SqlResult<()> {
        if index >= self.entries.len() {
            return Err(SqlError::misuse(format!(
                "index {} out of range for transaction with {} entries",
                index,
                self.entries.len()
            )));
        }
        self.entries.remove(index);
        Ok(())
    }

    /// Entry `index` as an independent transaction.
    ///
    /// A statement entry comes back as a single-statement transaction with
    /// this transaction's policy.
    pub fn transaction_at(&self, index: usize) -> Option<Transaction> {
        let entry = self.entries.get(index)?;
        Some(match entry {
            Entry::Nested(t) => t.clone(),
            Entry::Statement { .. } => self.single(entry.clone()),
        })
    }

    /// Statement text of each entry, nested entries flattened.
    pub fn statements(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry {
                Entry::Statement { statement, .. } => out.push(statement.text.clone()),
                Entry::Nested(t) => out.extend(t.statements()),
            }
        }
        out
    }

    fn single(&self, entry: Entry) -> Transaction {
        Transaction {
            client: Arc::clone(&self.client),
            entries: vec![entry],
            batch: false,
            stop_on_failure: self.stop_on_failure,
            merge: 0,
        }
    }

    /// Run every entry in order, then commit.
    ///
    /// Begins a transaction unless the client is already in one, and always
    /// ends with a commit. On failure the transaction is rolled back and the
    /// failing statement's error returned.
    pub fn execute(&self) -> SqlResult<()> {
        self.execute_on(&self.client)
    }

    /// Nested entries run on `client` too, so the whole tree shares one
    /// connection and one transaction.
    fn execute_on(&self, client: &Client) -> SqlResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let _guard = client.lock();
        if !client.is_in_transaction() {
            client.start_transaction()?;
        }
        let result = self.run_entries(client).and_then(|()| client.commit());
        if let Err(e) = result {
            if let Err(rollback) = client.rollback() {
                warn!(client = %client.name(), error = %rollback, "Rollback after failure also failed");
            }
            return Err(e);
        }
        Ok(())
    }

    fn run_entries(&self, client: &Client) -> SqlResult<()> {
        for entry in &self.entries {
            match entry {
                Entry::Statement { statement, .. } => {
                    client.simple_execute(statement)?;
                }
                Entry::Nested(t) => t.run_entries(client)?,
            }
        }
        Ok(())
    }

    /// [`execute_batch_returning_failures`](Self::execute_batch_returning_failures)
    /// without a failure collector or logging.
    pub fn execute_batch(&self) -> SqlResult<usize> {
        self.execute_batch_returning_failures(None, false)
    }

    /// Run the transaction; if it fails and this is a batch, run each entry
    /// on its own.
    ///
    /// Entries that fail (and, when stopping on failure, every entry not yet
    /// attempted) are appended to `failures` in order. Returns the number of
    /// statements that succeeded. A transaction that is not a batch behaves
    /// like [`execute`](Self::execute).
    pub fn execute_batch_returning_failures(
        &self,
        failures: Option<&mut Transaction>,
        log: bool,
    ) -> SqlResult<usize> {
        if let Some(collector) = failures.as_deref() {
            collector.check_client(self)?;
        }
        self.batch_on(&self.client, failures, log)
    }

    fn batch_on(
        &self,
        client: &Client,
        failures: Option<&mut Transaction>,
        log: bool,
    ) -> SqlResult<usize> {
        if !self.batch {
            self.execute_on(client)?;
            return Ok(self.total_count());
        }
        let _guard = client.lock();
        match self.execute_on(client) {
            Ok(()) => Ok(self.total_count()),
            Err(e) => {
                if log {
                    warn!(client = %client.name(), error = %e, "Batch failed, retrying statements individually");
                }
                let mut failures = failures;
                Ok(self.retry_entries(client, &mut failures, log))
            }
        }
    }

    fn retry_entries(
        &self,
        client: &Client,
        failures: &mut Option<&mut Transaction>,
        log: bool,
    ) -> usize {
        let mut succeeded = 0;
        let mut entries = self.entries.iter();
        while let Some(entry) = entries.next() {
            let failed = match entry {
                Entry::Statement { .. } => {
                    match self.single(entry.clone()).execute_on(client) {
                        Ok(()) => {
                            succeeded += entry.count();
                            false
                        }
                        Err(e) => {
                            if log {
                                warn!(
                                    client = %client.name(),
                                    sql = e.statement_text().unwrap_or_default(),
                                    error = %e,
                                    "Batch statement failed"
                                );
                            }
                            push_failure(failures, entry.clone());
                            true
                        }
                    }
                }
                Entry::Nested(nested) => {
                    let mut nested_failures = nested.empty_like();
                    match nested.batch_on(client, Some(&mut nested_failures), log) {
                        Ok(n) => succeeded += n,
                        Err(e) => {
                            if log {
                                warn!(client = %client.name(), error = %e, "Nested transaction failed");
                            }
                            nested_failures = nested.clone();
                        }
                    }
                    let failed = !nested_failures.is_empty();
                    if failed {
                        push_failure(failures, Entry::Nested(nested_failures));
                    }
                    failed
                }
            };
            if failed && self.stop_on_failure {
                for rest in entries.by_ref() {
                    push_failure(failures, rest.clone());
                }
                break;
            }
        }
        succeeded
    }

    fn empty_like(&self) -> Transaction {
        Transaction {
            client: Arc::clone(&self.client),
            entries: Vec::new(),
            batch: self.batch,
            stop_on_failure: self.stop_on_failure,
            merge: 0,
        }
    }
}

fn push_failure(failures: &mut Option<&mut Transaction>, entry: Entry) {
    if let Some(collector) = failures.as_deref_mut() {
        collector.entries.push(entry);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("client", &self.client.name())
            .field("entries", &self.entries.len())
            .field("total", &self.total_count())
            .field("batch", &self.batch)
            .field("stop_on_failure", &self.stop_on_failure)
            .field("merge", &self.merge)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    /// `INSERT ... VALUES (...)`: value tuples are concatenated.
    Insert,
    /// `UPDATE ... WHERE` / `DELETE ... WHERE`: conditions are OR-combined.
    Condition,
}

#[derive(Debug, Clone, Copy)]
struct MergeShape {
    kind: MergeKind,
    /// Byte offset just past the keyword.
    split: usize,
}

impl MergeShape {
    fn of(text: &str) -> Option<Self> {
        let trimmed = text.trim_start();
        let offset = text.len() - trimmed.len();
        let (kind, keyword) = if starts_with_ignore_case(trimmed, "INSERT") {
            (MergeKind::Insert, "VALUES")
        } else if starts_with_ignore_case(trimmed, "UPDATE")
            || starts_with_ignore_case(trimmed, "DELETE")
        {
            (MergeKind::Condition, "WHERE")
        } else {
            return None;
        };
        let at = find_keyword(trimmed, keyword)?;
        Some(Self {
            kind,
            split: offset + at + keyword.len(),
        })
    }

    /// Prefix through the keyword, and the tail with surrounding whitespace
    /// and trailing semicolons removed.
    fn split<'a>(&self, text: &'a str) -> (&'a str, &'a str) {
        let (prefix, tail) = text.split_at(self.split);
        let tail = tail.trim().trim_end_matches(';').trim_end();
        (prefix.trim_start(), tail)
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Offset of `keyword` as a whole token, ignoring ASCII case.
///
/// The keyword must follow the start of text, whitespace or `)` and be
/// followed by the end of text, whitespace or `(`.
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let needle = keyword.as_bytes();
    bytes
        .windows(needle.len())
        .enumerate()
        .filter(|(_, w)| w.eq_ignore_ascii_case(needle))
        .map(|(at, _)| at)
        .find(|&at| {
            let before = at.checked_sub(1).map(|i| bytes[i]);
            let after = bytes.get(at + needle.len()).copied();
            let open_before = match before {
                None | Some(b')') => true,
                Some(b) => b.is_ascii_whitespace(),
            };
            let open_after = match after {
                None | Some(b'(') => true,
                Some(b) => b.is_ascii_whitespace(),
            };
            open_before && open_after
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_shape() {
        let text = "INSERT INTO t (a) VALUES (1);";
        let shape = MergeShape::of(text).unwrap();
        assert_eq!(shape.kind, MergeKind::Insert);
        assert_eq!(shape.split(text), ("INSERT INTO t (a) VALUES", "(1)"));
    }

    #[test]
    fn test_condition_shape_is_case_insensitive() {
        let text = "  delete from t where id = 3 ; ";
        let shape = MergeShape::of(text).unwrap();
        assert_eq!(shape.kind, MergeKind::Condition);
        assert_eq!(shape.split(text), ("delete from t where", "id = 3"));
    }

    #[test]
    fn test_unmergeable_statements() {
        assert!(MergeShape::of("SELECT 1").is_none());
        assert!(MergeShape::of("UPDATE t SET a = 1").is_none());
        assert!(MergeShape::of("INSERT INTO t SELECT * FROM u").is_none());
    }

    #[test]
    fn test_find_keyword() {
        assert_eq!(find_keyword("abc VaLuEs", "VALUES"), Some(4));
        assert_eq!(find_keyword("(a)VALUES(1)", "VALUES"), Some(3));
        assert_eq!(find_keyword("abc", "VALUES"), None);
        assert_eq!(find_keyword("old_values", "VALUES"), None);
        assert_eq!(find_keyword("valuesx (1)", "VALUES"), None);
    }

    #[test]
    fn test_keyword_inside_identifier_is_skipped() {
        let text = "INSERT INTO old_values (a) VALUES (1)";
        let shape = MergeShape::of(text).unwrap();
        assert_eq!(shape.split(text), ("INSERT INTO old_values (a) VALUES", "(1)"));

        let text = "UPDATE t SET whereabouts = 'x' WHERE id = 1";
        let shape = MergeShape::of(text).unwrap();
        assert_eq!(shape.split(text), ("UPDATE t SET whereabouts = 'x' WHERE", "id = 1"));

        assert!(MergeShape::of("UPDATE t SET whereabouts = 'x'").is_none());
        assert!(MergeShape::of("INSERT INTO old_values SELECT * FROM u").is_none());
    }
}
