//! Rill Incremental - Push/pull operator pipelines for incremental view maintenance.
//!
//! A pipeline is a tree of operators rooted at table sources. Consumers pull
//! ordered nodes with [`Input::fetch`]; when a source table changes, the
//! change is pushed up through every operator as a [`Change`], and each
//! operator translates it into the changes its own output sees.
//!
//! - `TableSource`: in-memory table with lazily built per-ordering indexes
//!   and a one-slot overlay that keeps reentrant fetches consistent while a
//!   change is being pushed
//! - `Take`: limit, globally or per partition, with O(1) state per partition
//! - `Join`: hierarchical join attaching children as a named relationship
//! - `Filter`: stateless predicate filter
//!
//! # Example
//!
//! ```rust
//! use rill_core::{row, Sort, TableBuilder, ValueType};
//! use rill_incremental::{FetchRequest, Input, SourceChange, TableSource, Take};
//!
//! let spec = TableBuilder::new("issues")
//!     .unwrap()
//!     .add_column("id", ValueType::Number)
//!     .unwrap()
//!     .add_primary_key(&["id"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! let source = TableSource::new(spec);
//! for id in [3, 1, 2] {
//!     source.push(SourceChange::Add(row! { "id" => id })).unwrap();
//! }
//!
//! let take = Take::new(source.connect(Sort::asc(["id"]), None).unwrap(), 2, None).unwrap();
//! let rows: Vec<_> = take.fetch(FetchRequest::new()).unwrap().map(|n| n.row).collect();
//! assert_eq!(rows, vec![row! { "id" => 1 }, row! { "id" => 2 }]);
//! ```

pub mod change;
pub mod condition;
mod node;
pub mod operator;
pub mod operators;
mod schema;
mod source;

pub use change::{Change, ChildChange, SourceChange};
pub use condition::{Condition, Predicate, SimpleOperator};
pub use node::Node;
pub use operator::{first, take, Basis, Constraint, FetchRequest, Input, Output, OutputSlot, Start, Stream};
pub use operators::{Filter, Join, JoinArgs, Take};
pub use schema::SourceSchema;
pub use source::{SourceInput, TableSource};
