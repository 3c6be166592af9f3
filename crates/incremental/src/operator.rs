//! The contract every pipeline stage implements.
//!
//! Data flows two ways through a pipeline. Downstream operators *pull* by
//! calling [`Input::fetch`] on the operator they own; upstream operators
//! *push* [`Change`]s into the [`Output`] registered with them. Downstream
//! operators own their inputs as `Rc<dyn Input>` while inputs only hold a
//! `Weak` reference to their output, so a pipeline never forms a cycle.

use crate::change::Change;
use crate::node::Node;
use crate::schema::SourceSchema;
use rill_core::{values_equal, Result, Row, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// A lazy, single-pass sequence of nodes.
pub type Stream<'a> = Box<dyn Iterator<Item = Node> + 'a>;

/// Where a fetch begins relative to `Start::row`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Basis {
    /// Begin one row before the start row.
    Before,
    /// Begin at the start row (inclusive).
    At,
    /// Begin after the start row (exclusive).
    After,
}

/// Anchor of a range fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Start {
    pub row: Row,
    pub basis: Basis,
}

/// Equality constraint on one or more columns.
///
/// Matching uses join semantics: a null on either side never matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Constraint {
    pairs: Vec<(String, Value)>,
}

impl Constraint {
    /// Creates a single-column constraint.
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            pairs: vec![(column.into(), value.into())],
        }
    }

    /// Creates a constraint from `(column, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Self {
            pairs: pairs.into_iter().map(|(c, v)| (c.into(), v)).collect(),
        }
    }

    /// Creates a constraint on `columns` taking the values from `row`.
    pub fn from_row(columns: &[String], row: &Row) -> Self {
        Self {
            pairs: columns
                .iter()
                .map(|c| (c.clone(), row.get(c).clone()))
                .collect(),
        }
    }

    pub fn pairs(&self) -> &[(String, Value)] {
        &self.pairs
    }

    /// Returns the value a column is constrained to.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.pairs.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(c, _)| c.as_str())
    }

    /// Whether the constraint constrains exactly `columns` (in any order).
    pub fn has_columns(&self, columns: &[String]) -> bool {
        self.pairs.len() == columns.len() && columns.iter().all(|c| self.get(c).is_some())
    }

    /// Whether any row can match.
    pub fn is_satisfiable(&self) -> bool {
        self.pairs.iter().all(|(_, v)| !v.is_null())
    }

    /// Whether `row` matches every pair.
    #[inline]
    pub fn matches(&self, row: &Row) -> bool {
        self.pairs
            .iter()
            .all(|(column, value)| values_equal(row.get(column), value))
    }
}

/// A fetch (or cleanup) request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub constraint: Option<Constraint>,
    pub start: Option<Start>,
    /// Read the ordering backwards.
    pub reverse: bool,
}

impl FetchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn with_start(mut self, row: Row, basis: Basis) -> Self {
        self.start = Some(Start { row, basis });
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// The pull side of an operator.
pub trait Input {
    /// The schema of the nodes this input produces.
    fn schema(&self) -> &SourceSchema;

    /// Fetches nodes in schema order (or reverse order).
    fn fetch(&self, req: FetchRequest) -> Result<Stream<'_>>;

    /// Like `fetch`, but signals that the caller is tearing down state built
    /// from a previous fetch of the same range.
    fn cleanup(&self, req: FetchRequest) -> Result<Stream<'_>>;

    /// Registers the output changes are pushed to.
    fn set_output(&self, output: Weak<dyn Output>);

    /// Detaches this input (and everything upstream of it).
    fn destroy(&self);
}

/// The push side of an operator.
pub trait Output {
    fn push(&self, change: Change) -> Result<()>;
}

/// Holds an operator's registered output.
#[derive(Default)]
pub struct OutputSlot {
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl OutputSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    pub fn clear(&self) {
        self.output.borrow_mut().take();
    }

    /// Returns the output if it is registered and still alive.
    pub fn get(&self) -> Option<Rc<dyn Output>> {
        self.output.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Pushes to the output. A missing output drops the change.
    pub fn push(&self, change: Change) -> Result<()> {
        match self.get() {
            Some(output) => output.push(change),
            None => Ok(()),
        }
    }
}

/// Returns the first node of a stream.
#[inline]
pub fn first(mut stream: Stream<'_>) -> Option<Node> {
    stream.next()
}

/// Returns up to `n` nodes of a stream.
pub fn take(stream: Stream<'_>, n: usize) -> Vec<Node> {
    stream.take(n).collect()
}
