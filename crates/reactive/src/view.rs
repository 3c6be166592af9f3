//! Materialized view data.

use rill_core::{Row, Value};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;

/// Shape of a view: whether it holds one entry or a list, and the shape of
/// each relationship.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Format {
    pub singular: bool,
    pub relationships: BTreeMap<String, Format>,
}

impl Format {
    pub fn list() -> Self {
        Self::default()
    }

    pub fn singular() -> Self {
        Self {
            singular: true,
            relationships: BTreeMap::new(),
        }
    }

    /// Adds the format of a relationship.
    pub fn with_relationship(mut self, name: impl Into<String>, format: Format) -> Self {
        self.relationships.insert(name.into(), format);
        self
    }
}

/// A materialized row and its materialized relationships.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entry {
    pub row: Row,
    pub relationships: BTreeMap<String, View>,
}

impl Entry {
    pub fn new(row: Row) -> Self {
        Self {
            row,
            relationships: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn get(&self, column: &str) -> &Value {
        self.row.get(column)
    }

    pub fn relationship(&self, name: &str) -> Option<&View> {
        self.relationships.get(name)
    }
}

/// A list of entries, or at most one entry for singular formats.
#[derive(Clone, Debug, PartialEq)]
pub enum View {
    List(Vec<Entry>),
    Singular(Option<Box<Entry>>),
}

impl View {
    /// An empty view of the given format.
    pub fn empty(format: &Format) -> Self {
        if format.singular {
            View::Singular(None)
        } else {
            View::List(Vec::new())
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            View::List(entries) => entries.len(),
            View::Singular(entry) => usize::from(entry.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_list(&self) -> Option<&[Entry]> {
        match self {
            View::List(entries) => Some(entries),
            View::Singular(_) => None,
        }
    }

    pub fn as_singular(&self) -> Option<&Entry> {
        match self {
            View::Singular(entry) => entry.as_deref(),
            View::List(_) => None,
        }
    }

    /// Iterates over the entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        let (list, single) = match self {
            View::List(entries) => (entries.as_slice(), None),
            View::Singular(entry) => (&[][..], entry.as_deref()),
        };
        list.iter().chain(single)
    }
}

/// Entries serialize as one flat object: the row's columns followed by one
/// key per relationship.
impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.row.len() + self.relationships.len()))?;
        for (column, value) in self.row.iter() {
            map.serialize_entry(column, value)?;
        }
        for (name, view) in &self.relationships {
            map.serialize_entry(name, view)?;
        }
        map.end()
    }
}

impl Serialize for View {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            View::List(entries) => entries.serialize(serializer),
            View::Singular(entry) => entry.serialize(serializer),
        }
    }
}
