//! Undo journal for write transactions.
//!
//! A write transaction only ever appends (or overwrites) version-chain
//! entries tagged with its own version, which is newer than anything already
//! stored. Undoing it therefore only needs to know which chains it touched.

use crate::datum::StoredKey;

/// Key of a change-log entry: `None` marks a whole-table truncate and sorts
/// before every row key of the same table.
pub type LogKey = (String, Option<StoredKey>);

/// A single journal entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// A row version chain was written.
    Row { table: String, key: StoredKey },
    /// A change-log chain was written.
    Log { key: LogKey },
}

impl JournalEntry {
    /// Returns the table name for this entry.
    pub fn table(&self) -> &str {
        match self {
            JournalEntry::Row { table, .. } => table,
            JournalEntry::Log { key } => &key.0,
        }
    }
}

/// Records the chains a write transaction touched.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_row(&mut self, table: &str, key: StoredKey) {
        self.entries.push(JournalEntry::Row {
            table: table.to_string(),
            key,
        });
    }

    pub fn record_log(&mut self, key: LogKey) {
        self.entries.push(JournalEntry::Log { key });
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes the entries, leaving the journal empty.
    pub fn take(&mut self) -> Vec<JournalEntry> {
        core::mem::take(&mut self.entries)
    }
}
