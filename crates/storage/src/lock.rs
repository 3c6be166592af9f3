//! Lock management for the replica.
//!
//! Readers never block the writer: a read lock only pins the version its
//! snapshot reads at, so that `vacuum` keeps every row version the reader can
//! still observe. The single write lock serializes writers.

use rill_core::{Error, Result, Version};
use std::collections::BTreeMap;

/// Identifier of a replica connection.
pub type ConnectionId = u64;

/// Lock manager for reader pins and the writer slot.
#[derive(Debug, Default)]
pub struct LockManager {
    /// Read locks by holding connection.
    readers: BTreeMap<ConnectionId, Version>,
    /// Transaction id of the open writer (if any).
    writer: Option<u64>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the read lock for a connection at `version`.
    pub fn acquire_read(&mut self, conn: ConnectionId, version: Version) -> Result<()> {
        if self.readers.contains_key(&conn) {
            return Err(Error::invalid_operation(format!(
                "connection {} already holds a read lock",
                conn
            )));
        }
        self.readers.insert(conn, version);
        Ok(())
    }

    /// Releases a connection's read lock. Returns true if one was held.
    pub fn release_read(&mut self, conn: ConnectionId) -> bool {
        self.readers.remove(&conn).is_some()
    }

    /// Acquires the exclusive write lock.
    pub fn acquire_write(&mut self, tx_id: u64) -> Result<()> {
        match self.writer {
            Some(holder) if holder != tx_id => Err(Error::WriterBusy),
            _ => {
                self.writer = Some(tx_id);
                Ok(())
            }
        }
    }

    pub fn release_write(&mut self, tx_id: u64) {
        if self.writer == Some(tx_id) {
            self.writer = None;
        }
    }

    /// Returns the version read by a connection, if it holds a lock.
    pub fn read_version(&self, conn: ConnectionId) -> Option<&Version> {
        self.readers.get(&conn)
    }

    /// Returns the oldest pinned version.
    pub fn oldest_read_version(&self) -> Option<&Version> {
        self.readers.values().min()
    }

    pub fn read_lock_count(&self) -> usize {
        self.readers.len()
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }
}
