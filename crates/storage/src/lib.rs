//! Rill Storage - Versioned replica and snapshot layer for the rill sync engine.
//!
//! This crate provides the storage layer including:
//!
//! - `Replica`: in-memory multi-version store with a change log
//! - `WriteTransaction`: the single writer, with rollback on drop
//! - `LockManager`: read-lock pins and the writer slot
//! - `Snapshot`: a read lock at one version on one connection
//! - `Snapshotter`: leapfrogging current/previous snapshots
//! - `SnapshotDiff`: the row changes between two snapshots
//!
//! # Example
//!
//! ```rust
//! use rill_core::{row, TableBuilder, ValueType, Version};
//! use rill_storage::{Replica, Snapshotter, StoredRow};
//!
//! let replica = Replica::new();
//! let schema = TableBuilder::new("users")
//!     .unwrap()
//!     .add_column("id", ValueType::Number)
//!     .unwrap()
//!     .add_column("name", ValueType::String)
//!     .unwrap()
//!     .add_primary_key(&["id"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! replica.create_table(schema).unwrap();
//!
//! let mut snapshotter = Snapshotter::new(&replica);
//! snapshotter.init().unwrap();
//!
//! let mut tx = replica.begin(Version::from_u64(1)).unwrap();
//! tx.set("users", StoredRow::new().with("id", 1).with("name", "Alice"))
//!     .unwrap();
//! tx.commit().unwrap();
//!
//! let diff = snapshotter.advance().unwrap();
//! let entries: Vec<_> = diff.iter().collect::<Result<_, _>>().unwrap();
//! assert_eq!(entries.len(), 1);
//! assert_eq!(entries[0].next_value, Some(row! { "id" => 1, "name" => "Alice" }));
//! ```

mod datum;
pub mod journal;
pub mod lock;
mod replica;
mod snapshot;
mod snapshotter;

pub use datum::{Datum, StoredKey, StoredRow};
pub use journal::{Journal, JournalEntry, LogKey};
pub use lock::{ConnectionId, LockManager};
pub use replica::{LogOp, Replica, TransactionState, WriteTransaction};
pub use snapshot::{Snapshot, SnapshotScan};
pub use snapshotter::{DiffEntry, DiffIter, SnapshotDiff, Snapshotter};
