//! In-memory multi-version replica.
//!
//! The replica is the backing store the snapshotter reads from. It keeps a
//! version chain per row and per change-log key, so that any number of
//! readers can each observe the store as of their own version while a single
//! writer appends newer versions.

use crate::datum::{StoredKey, StoredRow};
use crate::journal::{Journal, JournalEntry, LogKey};
use crate::lock::{ConnectionId, LockManager};
use rill_core::{Error, Result, TableSpec, Version};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::rc::Rc;
use tracing::{debug, trace};

/// Versions of one logical item, oldest first. `None` marks a deletion.
#[derive(Debug)]
pub(crate) struct VersionChain<T> {
    entries: Vec<(Version, Option<T>)>,
}

impl<T> VersionChain<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns the newest entry at or before `at`, unless it is a deletion.
    pub(crate) fn visible_at(&self, at: &Version) -> Option<(&Version, &T)> {
        let idx = self.entries.partition_point(|(v, _)| v <= at);
        if idx == 0 {
            return None;
        }
        let (version, value) = &self.entries[idx - 1];
        value.as_ref().map(|value| (version, value))
    }

    /// Writes a value at `version`, replacing an entry the same version wrote.
    fn write(&mut self, version: &Version, value: Option<T>) {
        match self.entries.last_mut() {
            Some((v, slot)) if v == version => *slot = value,
            _ => self.entries.push((version.clone(), value)),
        }
    }

    fn undo(&mut self, version: &Version) {
        if matches!(self.entries.last(), Some((v, _)) if v == version) {
            self.entries.pop();
        }
    }

    /// Drops versions no reader at or after `oldest` can observe.
    fn prune(&mut self, oldest: &Version) {
        let idx = self.entries.partition_point(|(v, _)| v <= oldest);
        if idx == 0 {
            return;
        }
        self.entries.drain(..idx - 1);
        if self.entries[0].1.is_none() {
            self.entries.remove(0);
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Operation recorded in the change log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOp {
    Set,
    Delete,
    Truncate,
}

/// A row as visible to a reader, with the version that wrote it.
#[derive(Clone, Debug)]
pub(crate) struct RowVersion {
    pub(crate) version: Version,
    pub(crate) row: Rc<StoredRow>,
}

/// A change-log entry as visible to a reader.
#[derive(Clone, Debug)]
pub(crate) struct LogRecord {
    pub(crate) key: LogKey,
    pub(crate) version: Version,
    pub(crate) op: LogOp,
}

struct TableData {
    spec: TableSpec,
    key_columns: Vec<String>,
    rows: BTreeMap<StoredKey, VersionChain<Rc<StoredRow>>>,
}

struct ReplicaState {
    tables: BTreeMap<String, TableData>,
    log: BTreeMap<LogKey, VersionChain<LogOp>>,
    head: Version,
    locks: LockManager,
    connections: BTreeSet<ConnectionId>,
    next_connection_id: ConnectionId,
    next_tx_id: u64,
}

impl ReplicaState {
    fn table(&self, name: &str) -> Result<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::table_not_found(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::table_not_found(name))
    }
}

/// Handle to a shared in-memory replica.
#[derive(Clone)]
pub struct Replica {
    state: Rc<RefCell<ReplicaState>>,
}

impl core::fmt::Debug for Replica {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Replica")
            .field("head", &state.head)
            .field("tables", &state.tables.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    /// Creates an empty replica at the initial version.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ReplicaState {
                tables: BTreeMap::new(),
                log: BTreeMap::new(),
                head: Version::from_u64(0),
                locks: LockManager::new(),
                connections: BTreeSet::new(),
                next_connection_id: 1,
                next_tx_id: 1,
            })),
        }
    }

    /// Registers a table.
    pub fn create_table(&self, spec: TableSpec) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.tables.contains_key(spec.name()) {
            return Err(Error::invalid_operation(format!(
                "table {} already exists",
                spec.name()
            )));
        }
        let key_columns = spec.primary_key().columns().to_vec();
        state.tables.insert(
            spec.name().to_string(),
            TableData {
                spec,
                key_columns,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Returns a table definition.
    pub fn table_spec(&self, table: &str) -> Result<TableSpec> {
        Ok(self.state.borrow().table(table)?.spec.clone())
    }

    /// Returns the registered table names in order.
    pub fn table_names(&self) -> Vec<String> {
        self.state.borrow().tables.keys().cloned().collect()
    }

    /// Returns the latest committed version.
    pub fn head(&self) -> Version {
        self.state.borrow().head.clone()
    }

    /// Begins the (single) write transaction at `version`.
    pub fn begin(&self, version: Version) -> Result<WriteTransaction> {
        let mut state = self.state.borrow_mut();
        if version <= state.head {
            return Err(Error::InvalidVersion {
                version,
                head: state.head.clone(),
            });
        }
        let id = state.next_tx_id;
        state.locks.acquire_write(id)?;
        state.next_tx_id += 1;
        Ok(WriteTransaction {
            replica: self.clone(),
            id,
            version,
            journal: Journal::new(),
            state: TransactionState::Active,
        })
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.state.borrow().connections.len()
    }

    /// Returns the number of held read locks.
    pub fn read_lock_count(&self) -> usize {
        self.state.borrow().locks.read_lock_count()
    }

    /// Discards row and log versions that neither the head nor any locked
    /// reader can observe. Returns the number of chains left.
    pub fn vacuum(&self) -> usize {
        let mut state = self.state.borrow_mut();
        let oldest = match state.locks.oldest_read_version() {
            Some(v) if *v < state.head => v.clone(),
            _ => state.head.clone(),
        };
        let mut remaining = 0;
        for table in state.tables.values_mut() {
            table.rows.retain(|_, chain| {
                chain.prune(&oldest);
                !chain.is_empty()
            });
            remaining += table.rows.len();
        }
        state.log.retain(|_, chain| {
            chain.prune(&oldest);
            !chain.is_empty()
        });
        remaining += state.log.len();
        debug!(oldest = %oldest, remaining, "vacuumed replica");
        remaining
    }

    pub(crate) fn open_connection(&self) -> ConnectionId {
        let mut state = self.state.borrow_mut();
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.insert(id);
        trace!(connection = id, "opened replica connection");
        id
    }

    pub(crate) fn close_connection(&self, id: ConnectionId) {
        let mut state = self.state.borrow_mut();
        state.locks.release_read(id);
        state.connections.remove(&id);
        trace!(connection = id, "closed replica connection");
    }

    /// Acquires a read lock at the current head and returns the head.
    pub(crate) fn begin_read(&self, id: ConnectionId) -> Result<Version> {
        let mut state = self.state.borrow_mut();
        let head = state.head.clone();
        state.locks.acquire_read(id, head.clone())?;
        Ok(head)
    }

    pub(crate) fn end_read(&self, id: ConnectionId) -> bool {
        self.state.borrow_mut().locks.release_read(id)
    }

    pub(crate) fn key_columns(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.state.borrow().table(table)?.key_columns.clone())
    }

    pub(crate) fn row_at(
        &self,
        table: &str,
        key: &[crate::datum::Datum],
        at: &Version,
    ) -> Result<Option<RowVersion>> {
        let state = self.state.borrow();
        let table = state.table(table)?;
        Ok(table
            .rows
            .get(key)
            .and_then(|chain| chain.visible_at(at))
            .map(|(version, row)| RowVersion {
                version: version.clone(),
                row: Rc::clone(row),
            }))
    }

    /// Returns the first row after `after` (in key order) visible at `at`.
    pub(crate) fn next_row(
        &self,
        table: &str,
        after: Option<&StoredKey>,
        at: &Version,
    ) -> Result<Option<(StoredKey, RowVersion)>> {
        let state = self.state.borrow();
        let table = state.table(table)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        for (key, chain) in table.rows.range::<StoredKey, _>((lower, Bound::Unbounded)) {
            if let Some((version, row)) = chain.visible_at(at) {
                return Ok(Some((
                    key.clone(),
                    RowVersion {
                        version: version.clone(),
                        row: Rc::clone(row),
                    },
                )));
            }
        }
        Ok(None)
    }

    /// Returns the first log entry after `after` that is visible at `at` and
    /// newer than `since`.
    pub(crate) fn next_log_record(
        &self,
        after: Option<&LogKey>,
        since: &Version,
        at: &Version,
    ) -> Option<LogRecord> {
        let state = self.state.borrow();
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        state
            .log
            .range::<LogKey, _>((lower, Bound::Unbounded))
            .find_map(|(key, chain)| match chain.visible_at(at) {
                Some((version, op)) if version > since => Some(LogRecord {
                    key: key.clone(),
                    version: version.clone(),
                    op: *op,
                }),
                _ => None,
            })
    }

    /// Counts log entries visible at `at` that are newer than `since`.
    pub(crate) fn count_log_records(&self, since: &Version, at: &Version) -> usize {
        self.state
            .borrow()
            .log
            .values()
            .filter(|chain| matches!(chain.visible_at(at), Some((v, _)) if v > since))
            .count()
    }
}

/// Transaction state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been rolled back.
    RolledBack,
}

/// The single writer of a replica. Dropping an uncommitted transaction rolls
/// it back.
pub struct WriteTransaction {
    replica: Replica,
    id: u64,
    version: Version,
    journal: Journal,
    state: TransactionState,
}

impl WriteTransaction {
    /// Returns the version this transaction commits at.
    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::invalid_operation("Transaction is not active"));
        }
        Ok(())
    }

    /// Inserts or replaces a row.
    pub fn set(&mut self, table: &str, row: StoredRow) -> Result<()> {
        self.check_active()?;
        let mut state = self.replica.state.borrow_mut();
        let data = state.table_mut(table)?;
        for column in row.columns() {
            if data.spec.column_type(column).is_none() {
                return Err(Error::column_not_found(table, column));
            }
        }
        let key = row.key(&data.key_columns);
        data.rows
            .entry(key.clone())
            .or_insert_with(VersionChain::new)
            .write(&self.version, Some(Rc::new(row)));
        self.journal.record_row(table, key.clone());

        let log_key = (table.to_string(), Some(key));
        state
            .log
            .entry(log_key.clone())
            .or_insert_with(VersionChain::new)
            .write(&self.version, Some(LogOp::Set));
        self.journal.record_log(log_key);
        Ok(())
    }

    /// Deletes the row whose primary key matches `key`. Returns true if a
    /// row was visible.
    pub fn delete(&mut self, table: &str, key: &StoredRow) -> Result<bool> {
        self.check_active()?;
        let mut state = self.replica.state.borrow_mut();
        let data = state.table_mut(table)?;
        let key = key.key(&data.key_columns);
        let existed = match data.rows.get_mut(&key) {
            Some(chain) if chain.visible_at(&self.version).is_some() => {
                chain.write(&self.version, None);
                true
            }
            _ => false,
        };
        if existed {
            self.journal.record_row(table, key.clone());
        }

        let log_key = (table.to_string(), Some(key));
        state
            .log
            .entry(log_key.clone())
            .or_insert_with(VersionChain::new)
            .write(&self.version, Some(LogOp::Delete));
        self.journal.record_log(log_key);
        Ok(existed)
    }

    /// Deletes every row of a table. The table's keyed log entries are
    /// superseded by a single truncate entry.
    pub fn truncate(&mut self, table: &str) -> Result<()> {
        self.check_active()?;
        let version = self.version.clone();
        let mut state = self.replica.state.borrow_mut();
        let data = state.table_mut(table)?;
        for (key, chain) in data.rows.iter_mut() {
            if chain.visible_at(&version).is_some() {
                chain.write(&version, None);
                self.journal.record_row(table, key.clone());
            }
        }

        let start: LogKey = (table.to_string(), None);
        let keyed: Vec<LogKey> = state
            .log
            .range::<LogKey, _>((Bound::Excluded(&start), Bound::Unbounded))
            .take_while(|(key, _)| key.0 == table)
            .filter(|(_, chain)| chain.visible_at(&version).is_some())
            .map(|(key, _)| key.clone())
            .collect();
        for key in keyed {
            if let Some(chain) = state.log.get_mut(&key) {
                chain.write(&version, None);
            }
            self.journal.record_log(key);
        }
        state
            .log
            .entry(start.clone())
            .or_insert_with(VersionChain::new)
            .write(&version, Some(LogOp::Truncate));
        self.journal.record_log(start);
        Ok(())
    }

    /// Commits, making the writes visible to readers that begin afterwards.
    pub fn commit(mut self) -> Result<Version> {
        self.check_active()?;
        let mut state = self.replica.state.borrow_mut();
        state.head = self.version.clone();
        state.locks.release_write(self.id);
        self.state = TransactionState::Committed;
        debug!(version = %self.version, writes = self.journal.len(), "committed replica transaction");
        Ok(self.version.clone())
    }

    /// Discards every write of this transaction.
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        let mut state = self.replica.state.borrow_mut();
        for entry in self.journal.take() {
            match entry {
                JournalEntry::Row { table, key } => {
                    if let Ok(data) = state.table_mut(&table) {
                        if let Some(chain) = data.rows.get_mut(&key) {
                            chain.undo(&self.version);
                            if chain.is_empty() {
                                data.rows.remove(&key);
                            }
                        }
                    }
                }
                JournalEntry::Log { key } => {
                    if let Some(chain) = state.log.get_mut(&key) {
                        chain.undo(&self.version);
                        if chain.is_empty() {
                            state.log.remove(&key);
                        }
                    }
                }
            }
        }
        state.locks.release_write(self.id);
        self.state = TransactionState::RolledBack;
        debug!(version = %self.version, "rolled back replica transaction");
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        self.undo();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::Datum;
    use rill_core::{TableBuilder, ValueType};

    fn replica() -> Replica {
        let replica = Replica::new();
        replica
            .create_table(
                TableBuilder::new("issues")
                    .unwrap()
                    .add_column("id", ValueType::Number)
                    .unwrap()
                    .add_column("title", ValueType::String)
                    .unwrap()
                    .add_primary_key(&["id"])
                    .unwrap()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        replica
    }

    fn issue(id: i64, title: &str) -> StoredRow {
        StoredRow::new().with("id", id).with("title", title)
    }

    #[test]
    fn test_version_chain_visibility() {
        let mut chain = VersionChain::new();
        chain.write(&Version::from_u64(2), Some("a"));
        chain.write(&Version::from_u64(4), None);
        chain.write(&Version::from_u64(6), Some("b"));
        assert!(chain.visible_at(&Version::from_u64(1)).is_none());
        assert_eq!(chain.visible_at(&Version::from_u64(3)).map(|(_, v)| *v), Some("a"));
        assert!(chain.visible_at(&Version::from_u64(5)).is_none());
        assert_eq!(chain.visible_at(&Version::from_u64(9)).map(|(_, v)| *v), Some("b"));

        chain.prune(&Version::from_u64(5));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.visible_at(&Version::from_u64(6)).map(|(_, v)| *v), Some("b"));
    }

    #[test]
    fn test_commit_and_read_at_versions() {
        let replica = replica();
        let mut tx = replica.begin(Version::from_u64(1)).unwrap();
        tx.set("issues", issue(1, "a")).unwrap();
        tx.commit().unwrap();

        let mut tx = replica.begin(Version::from_u64(2)).unwrap();
        tx.set("issues", issue(1, "b")).unwrap();
        tx.commit().unwrap();
        assert_eq!(replica.head(), Version::from_u64(2));

        let key = vec![Datum::Integer(1)];
        let v1 = replica.row_at("issues", &key, &Version::from_u64(1)).unwrap().unwrap();
        assert_eq!(v1.row.get("title"), &Datum::from("a"));
        assert_eq!(v1.version, Version::from_u64(1));
        let v2 = replica.row_at("issues", &key, &Version::from_u64(2)).unwrap().unwrap();
        assert_eq!(v2.row.get("title"), &Datum::from("b"));
    }

    #[test]
    fn test_version_must_advance() {
        let replica = replica();
        replica.begin(Version::from_u64(3)).unwrap().commit().unwrap();
        assert!(matches!(
            replica.begin(Version::from_u64(3)),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_single_writer() {
        let replica = replica();
        let tx = replica.begin(Version::from_u64(1)).unwrap();
        assert!(matches!(replica.begin(Version::from_u64(2)), Err(Error::WriterBusy)));
        drop(tx);
        assert!(replica.begin(Version::from_u64(2)).is_ok());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let replica = replica();
        let mut tx = replica.begin(Version::from_u64(1)).unwrap();
        tx.set("issues", issue(1, "a")).unwrap();
        tx.commit().unwrap();

        let mut tx = replica.begin(Version::from_u64(2)).unwrap();
        tx.set("issues", issue(1, "changed")).unwrap();
        tx.set("issues", issue(2, "new")).unwrap();
        tx.truncate("issues").unwrap();
        tx.rollback();

        assert_eq!(replica.head(), Version::from_u64(1));
        let at = Version::from_u64(9);
        let row = replica
            .row_at("issues", &[Datum::Integer(1)], &at)
            .unwrap()
            .unwrap();
        assert_eq!(row.row.get("title"), &Datum::from("a"));
        assert!(replica.row_at("issues", &[Datum::Integer(2)], &at).unwrap().is_none());
        assert_eq!(replica.count_log_records(&Version::from_u64(0), &at), 1);
    }

    #[test]
    fn test_truncate_replaces_keyed_log_entries() {
        let replica = replica();
        let mut tx = replica.begin(Version::from_u64(1)).unwrap();
        tx.set("issues", issue(1, "a")).unwrap();
        tx.set("issues", issue(2, "b")).unwrap();
        tx.commit().unwrap();

        let mut tx = replica.begin(Version::from_u64(2)).unwrap();
        tx.truncate("issues").unwrap();
        tx.set("issues", issue(3, "c")).unwrap();
        tx.commit().unwrap();

        let at = Version::from_u64(2);
        let since = Version::from_u64(0);
        let first = replica.next_log_record(None, &since, &at).unwrap();
        assert_eq!(first.key, ("issues".to_string(), None));
        assert_eq!(first.op, LogOp::Truncate);
        let second = replica
            .next_log_record(Some(&first.key), &since, &at)
            .unwrap();
        assert_eq!(second.key.1, Some(vec![Datum::Integer(3)]));
        assert!(replica
            .next_log_record(Some(&second.key), &since, &at)
            .is_none());

        // Readers at the earlier version still see the keyed entries.
        assert_eq!(replica.count_log_records(&since, &Version::from_u64(1)), 2);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let replica = replica();
        let mut tx = replica.begin(Version::from_u64(1)).unwrap();
        let err = tx
            .set("issues", StoredRow::new().with("id", 1).with("bogus", 1))
            .unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound { .. }));
        assert!(matches!(
            tx.set("missing", issue(1, "a")),
            Err(Error::TableNotFound { .. })
        ));
    }

    #[test]
    fn test_vacuum_keeps_pinned_versions() {
        let replica = replica();
        for (v, title) in [(1, "a"), (2, "b"), (3, "c")] {
            let mut tx = replica.begin(Version::from_u64(v)).unwrap();
            tx.set("issues", issue(1, title)).unwrap();
            tx.commit().unwrap();
        }
        let reader = replica.open_connection();
        // Pin version 3 then rewind the pin to simulate an older reader.
        replica.begin_read(reader).unwrap();
        replica.end_read(reader);
        replica
            .state
            .borrow_mut()
            .locks
            .acquire_read(reader, Version::from_u64(2))
            .unwrap();

        replica.vacuum();
        let key = [Datum::Integer(1)];
        assert!(replica.row_at("issues", &key, &Version::from_u64(2)).unwrap().is_some());
        assert!(replica.row_at("issues", &key, &Version::from_u64(1)).unwrap().is_none());

        replica.close_connection(reader);
        replica.vacuum();
        assert!(replica.row_at("issues", &key, &Version::from_u64(2)).unwrap().is_none());
        assert!(replica.row_at("issues", &key, &Version::from_u64(3)).unwrap().is_some());
    }
}
