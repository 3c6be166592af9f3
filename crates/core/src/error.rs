//! Error types for the rill sync engine.

use crate::row::Row;
use crate::version::Version;
use thiserror::Error;

/// Result type alias for rill operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types shared by every layer of the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An `add` (or the new side of a key-changing edit) collided with a stored row.
    #[error("Row already exists in {table}: {row:?}")]
    RowAlreadyExists { table: String, row: Row },
    /// A `remove` or the old side of an `edit` referenced a missing row.
    #[error("Row not found in {table}: {row:?}")]
    RowNotFound { table: String, row: Row },
    /// A diff was read after its snapshotter advanced past it.
    #[error("Diff is no longer valid: {message}")]
    StaleDiff { message: String },
    /// A stored number cannot be represented exactly by the engine.
    #[error("Value out of range for column {column}: {value}")]
    ValueOutOfRange { column: String, value: String },
    /// An ordering omits a primary-key column.
    #[error("Ordering must include primary key column {column}")]
    InvalidOrdering { column: String },
    /// A write transaction used a version that is not past the head.
    #[error("Version {version} must be greater than head {head}")]
    InvalidVersion { version: Version, head: Version },
    /// A second writer tried to begin while one is open.
    #[error("A write transaction is already open")]
    WriterBusy,
    /// Table not found.
    #[error("Table not found: {name}")]
    TableNotFound { name: String },
    /// Column not found.
    #[error("Column {column} not found in table {table}")]
    ColumnNotFound { table: String, column: String },
    /// The snapshotter has not been initialized yet.
    #[error("Snapshotter has not been initialized")]
    NotInitialized,
    /// `init()` was called on an initialized component.
    #[error("Already initialized")]
    AlreadyInitialized,
    /// The snapshotter released its snapshots.
    #[error("Snapshotter has been released")]
    SnapshotterReleased,
    /// A view was hydrated twice.
    #[error("Can't hydrate twice")]
    AlreadyHydrated,
    /// Invalid operation.
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },
    /// Invalid configuration value.
    #[error("Invalid configuration {key}: {message}")]
    Config { key: String, message: String },
}

impl Error {
    /// Creates a row-already-exists error.
    pub fn row_already_exists(table: impl Into<String>, row: Row) -> Self {
        Error::RowAlreadyExists {
            table: table.into(),
            row,
        }
    }

    /// Creates a row-not-found error.
    pub fn row_not_found(table: impl Into<String>, row: Row) -> Self {
        Error::RowNotFound {
            table: table.into(),
            row,
        }
    }

    /// Creates a stale diff error.
    pub fn stale_diff(message: impl Into<String>) -> Self {
        Error::StaleDiff {
            message: message.into(),
        }
    }

    /// Creates a value range error.
    pub fn value_out_of_range(column: impl Into<String>, value: impl ToString) -> Self {
        Error::ValueOutOfRange {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Creates an invalid ordering error.
    pub fn invalid_ordering(column: impl Into<String>) -> Self {
        Error::InvalidOrdering {
            column: column.into(),
        }
    }

    /// Creates a table not found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Error::TableNotFound { name: name.into() }
    }

    /// Creates a column not found error.
    pub fn column_not_found(table: impl Into<String>, column: impl Into<String>) -> Self {
        Error::ColumnNotFound {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Returns true for the precondition failures raised by source pushes.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::RowAlreadyExists { .. } | Error::RowNotFound { .. })
    }
}
