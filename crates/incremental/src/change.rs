//! Change types propagated through a pipeline.

use crate::node::Node;
use rill_core::Row;

/// A change pushed from an operator to its output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// A node entered the result.
    Add(Node),
    /// A node left the result.
    Remove(Node),
    /// A row changed in place. The primary key is unchanged as far as the
    /// receiving operator is concerned.
    Edit { old_node: Node, node: Node },
    /// A change somewhere below `row` in one of its relationships.
    Child { row: Row, child: ChildChange },
}

/// A change to a relationship of some row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildChange {
    pub relationship_name: String,
    pub change: Box<Change>,
}

impl Change {
    /// Creates an edit of two bare rows.
    pub fn edit(old_row: Row, row: Row) -> Self {
        Change::Edit {
            old_node: Node::new(old_row),
            node: Node::new(row),
        }
    }

    /// Creates a child change.
    pub fn child(row: Row, relationship_name: impl Into<String>, change: Change) -> Self {
        Change::Child {
            row,
            child: ChildChange {
                relationship_name: relationship_name.into(),
                change: Box::new(change),
            },
        }
    }

    /// Returns the row the change is about: the new row for edits.
    pub fn row(&self) -> &Row {
        match self {
            Change::Add(node) | Change::Remove(node) => &node.row,
            Change::Edit { node, .. } => &node.row,
            Change::Child { row, .. } => row,
        }
    }

    /// Returns the kind of change as a short name.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Add(_) => "add",
            Change::Remove(_) => "remove",
            Change::Edit { .. } => "edit",
            Change::Child { .. } => "child",
        }
    }
}

/// A change applied to a source table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceChange {
    Add(Row),
    Remove(Row),
    Edit { old_row: Row, row: Row },
}

impl SourceChange {
    /// Returns the new row, or the removed row.
    pub fn row(&self) -> &Row {
        match self {
            SourceChange::Add(row) | SourceChange::Remove(row) => row,
            SourceChange::Edit { row, .. } => row,
        }
    }
}

impl From<SourceChange> for Change {
    fn from(change: SourceChange) -> Self {
        match change {
            SourceChange::Add(row) => Change::Add(Node::new(row)),
            SourceChange::Remove(row) => Change::Remove(Node::new(row)),
            SourceChange::Edit { old_row, row } => Change::edit(old_row, row),
        }
    }
}
