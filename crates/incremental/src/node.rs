//! Nodes: rows with their related child rows.

use rill_core::Row;
use std::collections::BTreeMap;

/// A row plus, for every relationship, the ordered child nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub row: Row,
    pub relationships: BTreeMap<String, Vec<Node>>,
}

impl Node {
    /// Creates a node without relationships.
    #[inline]
    pub fn new(row: Row) -> Self {
        Self {
            row,
            relationships: BTreeMap::new(),
        }
    }

    /// Builder-style relationship setter.
    pub fn with_relationship(mut self, name: impl Into<String>, children: Vec<Node>) -> Self {
        self.relationships.insert(name.into(), children);
        self
    }

    /// Returns the children of a relationship (empty if absent).
    pub fn children(&self, name: &str) -> &[Node] {
        self.relationships.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl From<Row> for Node {
    fn from(row: Row) -> Self {
        Node::new(row)
    }
}
