//! Schemas describing what an operator produces.

use core::cmp::Ordering;
use rill_core::{PrimaryKey, Result, Row, Sort, TableSpec, ValueType};
use std::collections::BTreeMap;

/// The shape of an operator's output: the table its rows come from, their
/// order, and the schemas of any relationships joined onto them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSchema {
    pub table_name: String,
    pub columns: BTreeMap<String, ValueType>,
    pub primary_key: PrimaryKey,
    pub sort: Sort,
    pub relationships: BTreeMap<String, SourceSchema>,
    /// Hidden rows are not materialized; their children are surfaced under
    /// the parent instead.
    pub is_hidden: bool,
}

impl SourceSchema {
    /// Creates the schema of a table read in `sort` order.
    pub fn for_table(spec: &TableSpec, sort: Sort) -> Self {
        Self {
            table_name: spec.name().to_string(),
            columns: spec.columns().clone(),
            primary_key: spec.primary_key().clone(),
            sort,
            relationships: BTreeMap::new(),
            is_hidden: false,
        }
    }

    /// Compares two rows under this schema's ordering.
    #[inline]
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        self.sort.compare_rows(a, b)
    }

    /// Fails unless the ordering contains every primary-key column.
    pub fn ensure_sort_includes_primary_key(&self) -> Result<()> {
        self.sort.ensure_includes_primary_key(&self.primary_key)
    }
}
