//! Rill Core - Core types shared by every layer of the rill sync engine.
//!
//! - `Value`: scalar cell values (null, boolean, number, string)
//! - `Row`: ordered mapping of column name to value
//! - `Sort`/`Order`: orderings and the row comparator they induce
//! - `PrimaryKey`/`TableSpec`: table definitions
//! - `Version`: lexicographically ordered watermarks
//! - `Error`: error types for engine operations
//!
//! # Example
//!
//! ```rust
//! use rill_core::{row, Order, Sort, TableBuilder, ValueType};
//!
//! let table = TableBuilder::new("issues")
//!     .unwrap()
//!     .add_column("id", ValueType::Number)
//!     .unwrap()
//!     .add_column("title", ValueType::String)
//!     .unwrap()
//!     .add_primary_key(&["id"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let sort = Sort::new([("title", Order::Asc), ("id", Order::Asc)]);
//! assert!(sort.ensure_includes_primary_key(table.primary_key()).is_ok());
//!
//! let a = row! { "id" => 1, "title" => "b" };
//! let b = row! { "id" => 2, "title" => "a" };
//! assert!(sort.compare_rows(&b, &a).is_lt());
//! ```

mod error;
mod row;
pub mod schema;
mod sort;
mod types;
mod value;
mod version;

pub use error::{Error, Result};
pub use row::Row;
pub use schema::{PrimaryKey, TableBuilder, TableSpec};
pub use sort::{Order, OrderPart, Sort};
pub use types::ValueType;
pub use value::{values_equal, Value, MAX_SAFE_INTEGER};
pub use version::Version;
