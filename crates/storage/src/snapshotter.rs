//! Snapshotter: a pair of leapfrogging snapshots and the diff between them.
//!
//! The snapshotter holds the current snapshot and the previous one. Each
//! `advance()` moves the previous snapshot's connection to the replica head,
//! making it the new current snapshot, so at most two connections are ever
//! open no matter how many versions elapse.
//!
//! The [`SnapshotDiff`] returned by `advance()` reads the change log between
//! the two snapshots. It is only valid until the next `advance()`, which
//! re-locks the connection the diff reads its "prev" side from. Reading a
//! diff after that fails with `Error::StaleDiff`.

use crate::datum::StoredKey;
use crate::journal::LogKey;
use crate::replica::{LogOp, Replica, RowVersion};
use crate::snapshot::{key_row, ConnectionState, Snapshot};
use hashbrown::HashSet;
use rill_core::{Error, Result, Row, Version};
use std::rc::{Rc, Weak};
use tracing::debug;

enum State {
    Uninitialized,
    Active {
        curr: Snapshot,
        prev: Option<Snapshot>,
    },
    Released {
        // Connections stay open until the snapshotter is dropped.
        conns: Vec<Rc<ConnectionState>>,
    },
}

/// Manages the current and previous snapshots of a replica.
pub struct Snapshotter {
    replica: Replica,
    state: State,
}

impl Snapshotter {
    pub fn new(replica: &Replica) -> Self {
        Self {
            replica: replica.clone(),
            state: State::Uninitialized,
        }
    }

    /// Opens the first snapshot at the replica head.
    pub fn init(&mut self) -> Result<&Snapshot> {
        match self.state {
            State::Uninitialized => {}
            State::Active { .. } => return Err(Error::AlreadyInitialized),
            State::Released { .. } => return Err(Error::SnapshotterReleased),
        }
        let curr = Snapshot::open(&self.replica)?;
        debug!(version = %curr.version(), "initialized snapshotter");
        self.state = State::Active { curr, prev: None };
        self.current()
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> Result<&Snapshot> {
        match &self.state {
            State::Uninitialized => Err(Error::NotInitialized),
            State::Active { curr, .. } => Ok(curr),
            State::Released { .. } => Err(Error::SnapshotterReleased),
        }
    }

    /// Whether `init()` has been called and the snapshots are still held.
    pub fn initialized(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    /// Moves to the replica head and returns the changes since the previous
    /// current snapshot.
    pub fn advance(&mut self) -> Result<SnapshotDiff> {
        let (curr, prev) = match core::mem::replace(&mut self.state, State::Uninitialized) {
            State::Active { curr, prev } => (curr, prev),
            State::Uninitialized => return Err(Error::NotInitialized),
            released @ State::Released { .. } => {
                self.state = released;
                return Err(Error::SnapshotterReleased);
            }
        };
        let next = match prev {
            Some(prev) => prev.reset_to_head(),
            None => Snapshot::open(&self.replica),
        };
        let next = match next {
            Ok(next) => next,
            Err(e) => {
                self.state = State::Active { curr, prev: None };
                return Err(e);
            }
        };

        let diff = SnapshotDiff::new(&curr, &next);
        debug!(
            prev = %diff.prev_version(),
            curr = %diff.curr_version(),
            changes = diff.changes(),
            "advanced snapshotter"
        );
        self.state = State::Active {
            curr: next,
            prev: Some(curr),
        };
        Ok(diff)
    }

    /// Releases both read locks. Connections stay open until the
    /// snapshotter is destroyed.
    pub fn release(&mut self) {
        let conns = match core::mem::replace(&mut self.state, State::Uninitialized) {
            State::Active { curr, prev } => {
                let mut conns = vec![curr.release()];
                conns.extend(prev.map(Snapshot::release));
                conns
            }
            State::Released { conns } => conns,
            State::Uninitialized => Vec::new(),
        };
        debug!(connections = conns.len(), "released snapshotter");
        self.state = State::Released { conns };
    }

    /// Releases the snapshots and closes the connections.
    pub fn destroy(mut self) {
        self.release();
    }
}

/// One endpoint of a diff: the connection it reads from, and the lock
/// generation and version observed when the diff was created.
#[derive(Debug)]
struct Endpoint {
    conn: Weak<ConnectionState>,
    generation: u64,
    version: Version,
}

impl Endpoint {
    fn of(snapshot: &Snapshot) -> Self {
        Self {
            conn: Rc::downgrade(snapshot.connection()),
            generation: snapshot.connection().generation(),
            version: snapshot.version().clone(),
        }
    }

    fn check(&self, side: &str) -> Result<Rc<ConnectionState>> {
        let conn = self
            .conn
            .upgrade()
            .ok_or_else(|| Error::stale_diff(format!("{} snapshot was closed", side)))?;
        if conn.generation() != self.generation {
            return Err(Error::stale_diff(format!(
                "{} snapshot at {} has since advanced",
                side, self.version
            )));
        }
        Ok(conn)
    }

    fn row(&self, conn: &ConnectionState, table: &str, key: &StoredKey) -> Result<Option<RowVersion>> {
        conn.replica().row_at(table, key, &self.version)
    }
}

/// A change to one row between two snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub table: String,
    /// The primary-key columns of the changed row.
    pub row_key: Row,
    /// The row at the previous snapshot, if it existed.
    pub prev_value: Option<Row>,
    /// The row at the current snapshot, if it exists.
    pub next_value: Option<Row>,
}

/// The changes between two snapshots of a [`Snapshotter`].
#[derive(Debug)]
pub struct SnapshotDiff {
    prev: Endpoint,
    curr: Endpoint,
    changes: usize,
}

impl SnapshotDiff {
    fn new(prev: &Snapshot, curr: &Snapshot) -> Self {
        let changes = curr
            .connection()
            .replica()
            .count_log_records(prev.version(), curr.version());
        Self {
            prev: Endpoint::of(prev),
            curr: Endpoint::of(curr),
            changes,
        }
    }

    pub fn prev_version(&self) -> &Version {
        &self.prev.version
    }

    pub fn curr_version(&self) -> &Version {
        &self.curr.version
    }

    /// Number of change-log entries between the snapshots. A truncate counts
    /// as one entry, though it expands to one `DiffEntry` per deleted row.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Iterates the changed rows. The iterator fails with
    /// `Error::StaleDiff` once the snapshotter advances again.
    pub fn iter(&self) -> DiffIter<'_> {
        DiffIter {
            diff: self,
            cursor: None,
            truncated: HashSet::new(),
            truncate_scan: None,
            done: false,
        }
    }

    fn check(&self) -> Result<(Rc<ConnectionState>, Rc<ConnectionState>)> {
        Ok((self.prev.check("prev")?, self.curr.check("curr")?))
    }

    fn check_prev_row(&self, found: Option<RowVersion>) -> Result<Option<RowVersion>> {
        match found {
            Some(found) if found.version > self.prev.version => Err(Error::stale_diff(format!(
                "row version {} is newer than prev snapshot {}",
                found.version, self.prev.version
            ))),
            found => Ok(found),
        }
    }
}

impl<'a> IntoIterator for &'a SnapshotDiff {
    type Item = Result<DiffEntry>;
    type IntoIter = DiffIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Deletes every row a truncated table held at the prev snapshot.
struct TruncateScan {
    table: String,
    cursor: Option<StoredKey>,
}

/// Iterator over a [`SnapshotDiff`].
pub struct DiffIter<'a> {
    diff: &'a SnapshotDiff,
    cursor: Option<LogKey>,
    truncated: HashSet<String>,
    truncate_scan: Option<TruncateScan>,
    done: bool,
}

impl DiffIter<'_> {
    fn next_truncated(&mut self) -> Result<Option<DiffEntry>> {
        let Some(scan) = self.truncate_scan.as_mut() else {
            return Ok(None);
        };
        let (prev, _) = self.diff.check()?;
        let found = prev
            .replica()
            .next_row(&scan.table, scan.cursor.as_ref(), &self.diff.prev.version)?;
        let Some((key, found)) = found else {
            self.truncate_scan = None;
            return Ok(None);
        };
        let found = self.diff.check_prev_row(Some(found))?;
        scan.cursor = Some(key.clone());
        Ok(Some(DiffEntry {
            table: scan.table.clone(),
            row_key: key_row(&prev, &scan.table, &key)?,
            prev_value: found.map(|f| f.row.to_row()).transpose()?,
            next_value: None,
        }))
    }

    fn next_logged(&mut self) -> Result<Option<DiffEntry>> {
        loop {
            if self.truncate_scan.is_some() {
                if let Some(entry) = self.next_truncated()? {
                    return Ok(Some(entry));
                }
            }

            let (prev, curr) = self.diff.check()?;
            let Some(record) = curr.replica().next_log_record(
                self.cursor.as_ref(),
                &self.diff.prev.version,
                &self.diff.curr.version,
            ) else {
                return Ok(None);
            };
            self.cursor = Some(record.key.clone());
            if record.version > self.diff.curr.version {
                return Err(Error::stale_diff(format!(
                    "change at {} is newer than curr snapshot {}",
                    record.version, self.diff.curr.version
                )));
            }

            let (table, key) = record.key;
            let key = match (key, record.op) {
                (None, LogOp::Truncate) => {
                    debug!(table = %table, version = %record.version, "diff includes truncate");
                    self.truncated.insert(table.clone());
                    self.truncate_scan = Some(TruncateScan {
                        table,
                        cursor: None,
                    });
                    continue;
                }
                (Some(key), LogOp::Set | LogOp::Delete) => key,
                _ => continue,
            };

            let prev_value = if self.truncated.contains(&table) {
                None
            } else {
                self.diff
                    .check_prev_row(self.diff.prev.row(&prev, &table, &key)?)?
            };
            let next_value = match record.op {
                LogOp::Set => match self.diff.curr.row(&curr, &table, &key)? {
                    Some(found) if found.version == record.version => Some(found),
                    _ => {
                        return Err(Error::stale_diff(format!(
                            "row written at {} in {} is missing from curr snapshot",
                            record.version, table
                        )))
                    }
                },
                _ => None,
            };
            if prev_value.is_none() && next_value.is_none() {
                continue;
            }
            return Ok(Some(DiffEntry {
                row_key: key_row(&curr, &table, &key)?,
                prev_value: prev_value.map(|f| f.row.to_row()).transpose()?,
                next_value: next_value.map(|f| f.row.to_row()).transpose()?,
                table,
            }));
        }
    }
}

impl Iterator for DiffIter<'_> {
    type Item = Result<DiffEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_logged() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
