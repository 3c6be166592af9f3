//! Rill Pipeline - Drives snapshot diffs through operator pipelines.
//!
//! The driver ties the layers together: a [`rill_storage::Snapshotter`]
//! produces a diff per advance, the diff is pushed into
//! [`rill_incremental::TableSource`]s, changes flow through each query's
//! operators, and every [`rill_reactive::ArrayView`] is flushed once.
//!
//! # Example
//!
//! ```rust
//! use rill_core::{Sort, TableBuilder, ValueType, Version};
//! use rill_incremental::Input;
//! use rill_pipeline::{PipelineConfig, PipelineDriver};
//! use rill_reactive::Format;
//! use rill_storage::{Replica, StoredRow};
//! use std::rc::Rc;
//!
//! let replica = Replica::new();
//! let spec = TableBuilder::new("users")
//!     .unwrap()
//!     .add_column("id", ValueType::Number)
//!     .unwrap()
//!     .add_primary_key(&["id"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! replica.create_table(spec).unwrap();
//!
//! let mut driver = PipelineDriver::new(&replica, PipelineConfig::default());
//! driver.init().unwrap();
//! let view = driver
//!     .add_query("users", Format::list(), |d: &PipelineDriver| {
//!         let input: Rc<dyn Input> = d.source("users")?.connect(Sort::asc(["id"]), None)?;
//!         Ok(input)
//!     })
//!     .unwrap();
//!
//! let mut tx = replica.begin(Version::from_u64(1)).unwrap();
//! tx.set("users", StoredRow::new().with("id", 1)).unwrap();
//! tx.commit().unwrap();
//!
//! driver.advance().unwrap();
//! assert_eq!(view.data().len(), 1);
//! ```

pub mod config;
mod driver;

pub use config::{ConfigError, PipelineConfig};
pub use driver::{AdvanceOutcome, PipelineDriver, QueryBuilder};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a global fmt subscriber filtered by `config.log_filter`.
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_tracing(config: &PipelineConfig) -> rill_core::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .map_err(|e| rill_core::Error::config(PipelineConfig::LOG_ENV, e.to_string()))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| rill_core::Error::config(PipelineConfig::LOG_ENV, e.to_string()))
}
