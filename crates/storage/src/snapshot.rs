//! Snapshots: a read lock at one version, held on one connection.

use crate::datum::{key_to_row, StoredKey, StoredRow};
use crate::lock::ConnectionId;
use crate::replica::{Replica, RowVersion};
use rill_core::{Result, Row, Version};
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

/// A physical connection to the replica.
///
/// The generation counts how often the connection's read lock has been
/// re-acquired, so that values derived from an earlier lock can tell they are
/// out of date.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    id: ConnectionId,
    replica: Replica,
    generation: Cell<u64>,
}

impl ConnectionState {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn replica(&self) -> &Replica {
        &self.replica
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.replica.close_connection(self.id);
    }
}

/// A consistent read-only view of the replica at one version.
///
/// A snapshot exclusively owns its connection. It is deliberately not
/// `Clone`: moving to a newer version consumes the snapshot.
#[derive(Debug)]
pub struct Snapshot {
    conn: Rc<ConnectionState>,
    version: Version,
}

impl Snapshot {
    /// Opens a new connection and locks it at the current head.
    pub fn open(replica: &Replica) -> Result<Self> {
        let conn = Rc::new(ConnectionState {
            id: replica.open_connection(),
            replica: replica.clone(),
            generation: Cell::new(0),
        });
        let version = replica.begin_read(conn.id)?;
        trace!(connection = conn.id, version = %version, "opened snapshot");
        Ok(Self { conn, version })
    }

    /// Returns the version this snapshot reads at.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Looks up a row by primary key. `key` needs only the key columns.
    pub fn get_row(&self, table: &str, key: &Row) -> Result<Option<Row>> {
        let key_columns = self.conn.replica.key_columns(table)?;
        let key = StoredRow::from_row(key).key(&key_columns);
        match self.row_version(table, &key)? {
            Some(found) => Ok(Some(found.row.to_row()?)),
            None => Ok(None),
        }
    }

    /// Scans a table in primary-key order.
    pub fn scan(&self, table: &str) -> Result<SnapshotScan> {
        // Fail early on unknown tables.
        self.conn.replica.key_columns(table)?;
        Ok(SnapshotScan {
            conn: Rc::clone(&self.conn),
            table: table.to_string(),
            version: self.version.clone(),
            cursor: None,
            done: false,
        })
    }

    /// Releases the read lock and re-acquires it at the current head on the
    /// same connection.
    pub fn reset_to_head(self) -> Result<Snapshot> {
        let replica = &self.conn.replica;
        replica.end_read(self.conn.id);
        let version = replica.begin_read(self.conn.id)?;
        self.conn.generation.set(self.conn.generation.get() + 1);
        trace!(
            connection = self.conn.id,
            from = %self.version,
            to = %version,
            "reset snapshot to head"
        );
        Ok(Snapshot {
            conn: self.conn,
            version,
        })
    }

    /// Releases the read lock, keeping the connection open.
    pub(crate) fn release(self) -> Rc<ConnectionState> {
        self.conn.replica.end_read(self.conn.id);
        self.conn.generation.set(self.conn.generation.get() + 1);
        self.conn
    }

    pub(crate) fn connection(&self) -> &Rc<ConnectionState> {
        &self.conn
    }

    pub(crate) fn row_version(&self, table: &str, key: &StoredKey) -> Result<Option<RowVersion>> {
        self.conn.replica.row_at(table, key, &self.version)
    }
}

/// Lazy full-table scan in key order.
///
/// Each step re-reads the replica from the last key returned, so the scan
/// holds no borrow of the replica between items.
pub struct SnapshotScan {
    conn: Rc<ConnectionState>,
    table: String,
    version: Version,
    cursor: Option<StoredKey>,
    done: bool,
}

impl SnapshotScan {
    /// Returns the next row together with its stored key.
    pub(crate) fn next_keyed(&mut self) -> Option<Result<(StoredKey, Row)>> {
        if self.done {
            return None;
        }
        let found = self
            .conn
            .replica
            .next_row(&self.table, self.cursor.as_ref(), &self.version);
        match found {
            Ok(Some((key, found))) => {
                self.cursor = Some(key.clone());
                Some(found.row.to_row().map(|row| (key, row)))
            }
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

impl Iterator for SnapshotScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_keyed().map(|r| r.map(|(_, row)| row))
    }
}

/// Converts a stored key into a row of key columns.
pub(crate) fn key_row(conn: &ConnectionState, table: &str, key: &[crate::datum::Datum]) -> Result<Row> {
    let key_columns = conn.replica.key_columns(table)?;
    key_to_row(&key_columns, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{row, TableBuilder, ValueType};

    fn replica() -> Replica {
        let replica = Replica::new();
        replica
            .create_table(
                TableBuilder::new("users")
                    .unwrap()
                    .add_column("id", ValueType::Number)
                    .unwrap()
                    .add_column("name", ValueType::String)
                    .unwrap()
                    .add_primary_key(&["id"])
                    .unwrap()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        replica
    }

    fn write(replica: &Replica, version: u64, rows: &[(i64, &str)]) {
        let mut tx = replica.begin(Version::from_u64(version)).unwrap();
        for (id, name) in rows {
            tx.set("users", StoredRow::new().with("id", *id).with("name", *name))
                .unwrap();
        }
        tx.commit().unwrap();
    }

    #[test]
    fn test_snapshot_isolation() {
        let replica = replica();
        write(&replica, 1, &[(1, "alice")]);
        let snapshot = Snapshot::open(&replica).unwrap();
        write(&replica, 2, &[(1, "bob"), (2, "carol")]);

        assert_eq!(snapshot.version(), &Version::from_u64(1));
        assert_eq!(
            snapshot.get_row("users", &row! { "id" => 1 }).unwrap(),
            Some(row! { "id" => 1, "name" => "alice" })
        );
        assert_eq!(snapshot.get_row("users", &row! { "id" => 2 }).unwrap(), None);
        let rows: Vec<Row> = snapshot.scan("users").unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_reset_to_head_reuses_connection() {
        let replica = replica();
        write(&replica, 1, &[(1, "alice")]);
        let snapshot = Snapshot::open(&replica).unwrap();
        let id = snapshot.connection().id();
        write(&replica, 2, &[(2, "bob")]);

        let snapshot = snapshot.reset_to_head().unwrap();
        assert_eq!(snapshot.version(), &Version::from_u64(2));
        assert_eq!(snapshot.connection().id(), id);
        assert_eq!(snapshot.connection().generation(), 1);
        assert_eq!(replica.connection_count(), 1);
        assert_eq!(replica.read_lock_count(), 1);

        let names: Vec<Row> = snapshot.scan("users").unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(
            names,
            vec![
                row! { "id" => 1, "name" => "alice" },
                row! { "id" => 2, "name" => "bob" },
            ]
        );
    }

    #[test]
    fn test_drop_closes_connection() {
        let replica = replica();
        let snapshot = Snapshot::open(&replica).unwrap();
        assert_eq!(replica.connection_count(), 1);
        let conn = snapshot.release();
        assert_eq!(replica.read_lock_count(), 0);
        assert_eq!(replica.connection_count(), 1);
        drop(conn);
        assert_eq!(replica.connection_count(), 0);
    }

    #[test]
    fn test_unknown_table() {
        let replica = replica();
        let snapshot = Snapshot::open(&replica).unwrap();
        assert!(snapshot.scan("nope").is_err());
        assert!(snapshot.get_row("nope", &row! { "id" => 1 }).is_err());
    }

    #[test]
    fn test_scan_out_of_range_value() {
        let replica = replica();
        let mut tx = replica.begin(Version::from_u64(1)).unwrap();
        tx.set("users", StoredRow::new().with("id", i64::MAX)).unwrap();
        tx.commit().unwrap();
        let snapshot = Snapshot::open(&replica).unwrap();
        let mut scan = snapshot.scan("users").unwrap();
        assert!(matches!(
            scan.next(),
            Some(Err(rill_core::Error::ValueOutOfRange { .. }))
        ));
        assert!(scan.next().is_none());
    }
}
