//! Rill Reactive - Materialized views over operator pipelines.
//!
//! An [`ArrayView`] sits at the end of a pipeline and keeps its result as a
//! tree of sorted entries. Changes pushed through the pipeline update the
//! tree immediately; listeners are called with the full data once per
//! [`ArrayView::flush`].
//!
//! # Example
//!
//! ```rust
//! use rill_core::{row, Sort, TableBuilder, ValueType};
//! use rill_incremental::{SourceChange, TableSource};
//! use rill_reactive::{ArrayView, Format};
//!
//! let spec = TableBuilder::new("users")
//!     .unwrap()
//!     .add_column("id", ValueType::Number)
//!     .unwrap()
//!     .add_primary_key(&["id"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! let source = TableSource::new(spec);
//! let view = ArrayView::new(source.connect(Sort::asc(["id"]), None).unwrap(), Format::list()).unwrap();
//! view.hydrate().unwrap();
//!
//! source.push(SourceChange::Add(row! { "id" => 1 })).unwrap();
//! view.flush();
//! assert_eq!(view.data().len(), 1);
//! ```

pub mod array_view;
pub mod subscription;
pub mod view;

pub use array_view::ArrayView;
pub use subscription::{Subscription, SubscriptionId, SubscriptionManager, ViewCallback};
pub use view::{Entry, Format, View};
