//! Table definitions.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::sort::Sort;
use crate::types::ValueType;
use crate::value::Value;
use std::collections::BTreeMap;

/// Ordered, non-empty list of primary-key columns.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrimaryKey {
    columns: Vec<String>,
}

impl PrimaryKey {
    /// Creates a primary key; fails if no column is given.
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(Error::invalid_operation("primary key must not be empty"));
        }
        Ok(Self { columns })
    }

    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the row's key values in key-column order.
    pub fn key_of(&self, row: &Row) -> Vec<Value> {
        row.values_for(&self.columns)
    }

    /// Ascending ordering over the key columns (the primary index order).
    pub fn sort(&self) -> Sort {
        Sort::asc(self.columns.iter().cloned())
    }
}

/// A table definition: name, typed columns and primary key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    name: String,
    columns: BTreeMap<String, ValueType>,
    primary_key: PrimaryKey,
}

impl TableSpec {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn columns(&self) -> &BTreeMap<String, ValueType> {
        &self.columns
    }

    #[inline]
    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn column_type(&self, column: &str) -> Option<ValueType> {
        self.columns.get(column).copied()
    }
}

/// Builder for table definitions.
pub struct TableBuilder {
    name: String,
    columns: BTreeMap<String, ValueType>,
    primary_key: Option<PrimaryKey>,
}

impl TableBuilder {
    /// Creates a builder for a table.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_operation("table name must not be empty"));
        }
        Ok(Self {
            name,
            columns: BTreeMap::new(),
            primary_key: None,
        })
    }

    /// Adds a column.
    pub fn add_column(mut self, name: impl Into<String>, value_type: ValueType) -> Result<Self> {
        let name = name.into();
        if self.columns.contains_key(&name) {
            return Err(Error::invalid_operation(format!(
                "duplicate column {} in table {}",
                name, self.name
            )));
        }
        self.columns.insert(name, value_type);
        Ok(self)
    }

    /// Sets the primary key; every key column must already be declared.
    pub fn add_primary_key(mut self, columns: &[&str]) -> Result<Self> {
        for column in columns {
            if !self.columns.contains_key(*column) {
                return Err(Error::column_not_found(self.name.clone(), *column));
            }
        }
        self.primary_key = Some(PrimaryKey::new(columns.iter().copied())?);
        Ok(self)
    }

    /// Builds the table definition.
    pub fn build(self) -> Result<TableSpec> {
        let primary_key = self.primary_key.ok_or_else(|| {
            Error::invalid_operation(format!("table {} has no primary key", self.name))
        })?;
        Ok(TableSpec {
            name: self.name,
            columns: self.columns,
            primary_key,
        })
    }
}
