//! Table sources: the leaves of every pipeline.
//!
//! A [`TableSource`] holds the rows of one table and serves any number of
//! connections, each reading in its own order. Rows are kept in one ordered
//! index per distinct (constraint columns, ordering) pair, created on first
//! use and dropped once no connection uses it.
//!
//! Writes go through [`TableSource::push`], which notifies every connected
//! output *before* changing the indexes. While output `k` is being notified,
//! the pending change is installed as an overlay: fetches from connections
//! `0..=k` see the change, later connections do not. Each fetch captures the
//! overlay when it is issued; the overlay is cleared when the push returns,
//! on error paths included.

use crate::change::{Change, SourceChange};
use crate::condition::{Condition, Predicate};
use crate::node::Node;
use crate::operator::{Basis, Constraint, FetchRequest, Input, Output, Stream};
use crate::schema::SourceSchema;
use core::cmp::Reverse;
use rill_core::{Error, Order, Result, Row, Sort, TableSpec, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// A column value inside an index key, widened with sentinels that sort
/// before and after every value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum BoundValue {
    Min,
    Value(Value),
    Max,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Asc(BoundValue),
    Desc(Reverse<BoundValue>),
}

/// Index key: one part per column of the index ordering.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey(Vec<KeyPart>);

impl IndexKey {
    fn of(sort: &Sort, row: &Row) -> Self {
        Self(
            sort.parts()
                .iter()
                .map(|part| wrap(part.order, BoundValue::Value(row.get(&part.column).clone())))
                .collect(),
        )
    }

    /// The smallest (`low`) or largest key of rows matching `constraint`.
    fn edge(sort: &Sort, constraint: &Constraint, low: bool) -> Self {
        Self(
            sort.parts()
                .iter()
                .map(|part| {
                    let value = match constraint.get(&part.column) {
                        Some(v) => BoundValue::Value(v.clone()),
                        None => match (part.order, low) {
                            (Order::Asc, true) | (Order::Desc, false) => BoundValue::Min,
                            (Order::Asc, false) | (Order::Desc, true) => BoundValue::Max,
                        },
                    };
                    wrap(part.order, value)
                })
                .collect(),
        )
    }
}

fn wrap(order: Order, value: BoundValue) -> KeyPart {
    match order {
        Order::Asc => KeyPart::Asc(value),
        Order::Desc => KeyPart::Desc(Reverse(value)),
    }
}

struct Index {
    data: BTreeMap<IndexKey, Row>,
    used_by: BTreeSet<usize>,
}

impl Index {
    fn apply(&mut self, sort: &Sort, change: &SourceChange) {
        match change {
            SourceChange::Add(row) => {
                self.data.insert(IndexKey::of(sort, row), row.clone());
            }
            SourceChange::Remove(row) => {
                self.data.remove(&IndexKey::of(sort, row));
            }
            SourceChange::Edit { old_row, row } => {
                self.data.remove(&IndexKey::of(sort, old_row));
                self.data.insert(IndexKey::of(sort, row), row.clone());
            }
        }
    }
}

struct ConnectionRecord {
    sort: Sort,
    predicate: Option<Predicate>,
    output: Option<Weak<dyn Output>>,
}

struct Overlay {
    output_index: usize,
    change: SourceChange,
}

struct SourceState {
    spec: TableSpec,
    primary_sort: Sort,
    indexes: BTreeMap<Sort, Index>,
    /// Arena of connections; a slot is emptied when its connection is
    /// destroyed so that indices stay stable.
    connections: Vec<Option<ConnectionRecord>>,
    overlay: Option<Overlay>,
}

impl SourceState {
    fn primary(&self) -> Option<&Index> {
        self.indexes.get(&self.primary_sort)
    }

    fn contains(&self, row: &Row) -> bool {
        self.primary()
            .map(|index| index.data.contains_key(&IndexKey::of(&self.primary_sort, row)))
            .unwrap_or(false)
    }

    fn ensure_index(&mut self, sort: &Sort, connection: usize) {
        if let Some(index) = self.indexes.get_mut(sort) {
            index.used_by.insert(connection);
            return;
        }
        let data: BTreeMap<IndexKey, Row> = self
            .primary()
            .map(|primary| {
                primary
                    .data
                    .values()
                    .map(|row| (IndexKey::of(sort, row), row.clone()))
                    .collect()
            })
            .unwrap_or_default();
        debug!(table = %self.spec.name(), rows = data.len(), index = ?sort, "created source index");
        self.indexes.insert(
            sort.clone(),
            Index {
                data,
                used_by: BTreeSet::from([connection]),
            },
        );
    }

    fn disconnect(&mut self, connection: usize) {
        if let Some(slot) = self.connections.get_mut(connection) {
            if slot.take().is_none() {
                return;
            }
        }
        let primary_sort = self.primary_sort.clone();
        self.indexes.retain(|sort, index| {
            if *sort == primary_sort {
                return true;
            }
            index.used_by.remove(&connection);
            !index.used_by.is_empty()
        });
    }
}

/// Clears the source overlay when a push returns or unwinds.
struct OverlayGuard<'a> {
    state: &'a RefCell<SourceState>,
}

impl<'a> OverlayGuard<'a> {
    fn install(state: &'a RefCell<SourceState>, change: &SourceChange) -> Self {
        state.borrow_mut().overlay = Some(Overlay {
            output_index: 0,
            change: change.clone(),
        });
        Self { state }
    }

    fn notifying(&self, output_index: usize) {
        if let Some(overlay) = self.state.borrow_mut().overlay.as_mut() {
            overlay.output_index = output_index;
        }
    }
}

impl Drop for OverlayGuard<'_> {
    fn drop(&mut self) {
        self.state.borrow_mut().overlay = None;
    }
}

/// An in-memory table serving ordered, constrained reads to its
/// connections.
pub struct TableSource {
    state: Rc<RefCell<SourceState>>,
}

impl TableSource {
    /// Creates an empty source for a table.
    pub fn new(spec: TableSpec) -> Self {
        let primary_sort = spec.primary_key().sort();
        let mut indexes = BTreeMap::new();
        indexes.insert(
            primary_sort.clone(),
            Index {
                data: BTreeMap::new(),
                used_by: BTreeSet::new(),
            },
        );
        Self {
            state: Rc::new(RefCell::new(SourceState {
                spec,
                primary_sort,
                indexes,
                connections: Vec::new(),
                overlay: None,
            })),
        }
    }

    pub fn table_name(&self) -> String {
        self.state.borrow().spec.name().to_string()
    }

    pub fn spec(&self) -> TableSpec {
        self.state.borrow().spec.clone()
    }

    /// Number of rows in the table.
    pub fn len(&self) -> usize {
        self.state.borrow().primary().map_or(0, |index| index.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.borrow().connections.iter().flatten().count()
    }

    /// Registers a connection reading in `sort` order, optionally limited to
    /// rows matching `filters`.
    pub fn connect(&self, sort: Sort, filters: Option<Condition>) -> Result<Rc<SourceInput>> {
        let mut state = self.state.borrow_mut();
        let schema = SourceSchema::for_table(&state.spec, sort.clone());
        schema.ensure_sort_includes_primary_key()?;
        let index = state.connections.len();
        state.connections.push(Some(ConnectionRecord {
            sort,
            predicate: filters.map(Condition::into_predicate),
            output: None,
        }));
        trace!(table = %state.spec.name(), connection = index, "connected to source");
        Ok(Rc::new(SourceInput {
            state: Rc::clone(&self.state),
            index,
            schema,
        }))
    }

    /// Applies a change: notifies every connected output in connection order,
    /// then updates the indexes.
    ///
    /// Adding an existing row or removing (or editing) a missing row fails
    /// without notifying anyone.
    pub fn push(&self, change: SourceChange) -> Result<()> {
        let outputs: Vec<(usize, Weak<dyn Output>)> = {
            let state = self.state.borrow();
            let table = state.spec.name();
            match &change {
                SourceChange::Add(row) => {
                    if state.contains(row) {
                        return Err(Error::row_already_exists(table, row.clone()));
                    }
                }
                SourceChange::Remove(row) => {
                    if !state.contains(row) {
                        return Err(Error::row_not_found(table, row.clone()));
                    }
                }
                SourceChange::Edit { old_row, row } => {
                    if !state.contains(old_row) {
                        return Err(Error::row_not_found(table, old_row.clone()));
                    }
                    let moved = IndexKey::of(&state.primary_sort, old_row)
                        != IndexKey::of(&state.primary_sort, row);
                    if moved && state.contains(row) {
                        return Err(Error::row_already_exists(table, row.clone()));
                    }
                }
            }
            state
                .connections
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().and_then(|c| c.output.clone()).map(|o| (i, o)))
                .collect()
        };
        let pushed: Change = change.clone().into();
        trace!(
            table = %self.state.borrow().spec.name(),
            kind = pushed.kind(),
            outputs = outputs.len(),
            "source push"
        );

        {
            let guard = OverlayGuard::install(&self.state, &change);
            for (index, output) in outputs {
                let Some(output) = output.upgrade() else {
                    continue;
                };
                guard.notifying(index);
                output.push(pushed.clone())?;
            }
        }

        let mut state = self.state.borrow_mut();
        for (sort, index) in state.indexes.iter_mut() {
            index.apply(sort, &change);
        }
        Ok(())
    }

    /// The orderings of the indexes currently maintained.
    pub fn index_keys(&self) -> Vec<Sort> {
        self.state.borrow().indexes.keys().cloned().collect()
    }
}

/// A connection to a [`TableSource`].
pub struct SourceInput {
    state: Rc<RefCell<SourceState>>,
    index: usize,
    schema: SourceSchema,
}

impl SourceInput {
    /// Position of this connection in its source's notification order.
    pub fn connection_index(&self) -> usize {
        self.index
    }

    fn open(&self, req: &FetchRequest) -> Result<Option<SourceFetch>> {
        let mut state = self.state.borrow_mut();
        let (conn_sort, predicate) = match state.connections.get(self.index) {
            Some(Some(conn)) => (conn.sort.clone(), conn.predicate.clone()),
            _ => {
                return Err(Error::invalid_operation(
                    "fetch from a destroyed source connection",
                ))
            }
        };

        if let Some(constraint) = &req.constraint {
            if !constraint.is_satisfiable() {
                return Ok(None);
            }
            if let Some(start) = &req.start {
                if !constraint.matches(&start.row) {
                    return Err(Error::invalid_operation("start row must match constraint"));
                }
            }
        }

        // Rows matching a constraint must be contiguous, so the constraint
        // columns lead the index. A full primary-key constraint matches at
        // most one row and needs no further order.
        let mut index_sort = Sort::default();
        if let Some(constraint) = &req.constraint {
            for column in constraint.columns() {
                index_sort = index_sort.then(column, Order::Asc);
            }
        }
        let pk_constraint = req
            .constraint
            .as_ref()
            .map_or(false, |c| c.has_columns(state.spec.primary_key().columns()));
        if !pk_constraint {
            index_sort.extend_with(&conn_sort);
        }
        state.ensure_index(&index_sort, self.index);

        let matches = |row: &Row| {
            req.constraint.as_ref().map_or(true, |c| c.matches(row))
                && predicate.as_ref().map_or(true, |p| p(row))
        };
        let visible = state
            .overlay
            .as_ref()
            .filter(|o| self.index <= o.output_index);
        let (overlay_add, overlay_remove) = match visible.map(|o| &o.change) {
            None => (None, None),
            Some(SourceChange::Add(row)) => (Some(row), None),
            Some(SourceChange::Remove(row)) => (None, Some(row)),
            Some(SourceChange::Edit { old_row, row }) => (Some(row), Some(old_row)),
        };
        let mut overlay_add = overlay_add
            .filter(|row| matches(*row))
            .map(|row| (IndexKey::of(&index_sort, row), row.clone()));
        let overlay_remove = overlay_remove
            .filter(|row| matches(*row))
            .map(|row| IndexKey::of(&index_sort, row));

        let (low, high) = match &req.constraint {
            Some(c) => (
                Bound::Included(IndexKey::edge(&index_sort, c, true)),
                Bound::Included(IndexKey::edge(&index_sort, c, false)),
            ),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let index = state.indexes.get(&index_sort);
        let cursor = match &req.start {
            None if req.reverse => high,
            None => low,
            Some(start) => {
                let key = IndexKey::of(&index_sort, &start.row);
                match start.basis {
                    Basis::At => Bound::Included(key),
                    Basis::After => Bound::Excluded(key),
                    Basis::Before => {
                        // One row earlier in read order, overlay included.
                        let stored = index.and_then(|index| {
                            neighbor(
                                index,
                                &key,
                                req.reverse,
                                req.constraint.as_ref(),
                                overlay_remove.as_ref(),
                                &matches,
                            )
                        });
                        let pending = overlay_add.as_ref().map(|(k, _)| k).filter(|k| {
                            if req.reverse {
                                **k > key
                            } else {
                                **k < key
                            }
                        });
                        let nearest = match (stored, pending) {
                            (Some(s), Some(p)) if req.reverse => Some(s.min(p.clone())),
                            (Some(s), Some(p)) => Some(s.max(p.clone())),
                            (s, p) => s.or_else(|| p.cloned()),
                        };
                        match nearest {
                            Some(k) => Bound::Included(k),
                            None if req.reverse => high,
                            None => low,
                        }
                    }
                }
            }
        };

        if let Some((key, _)) = &overlay_add {
            let in_range = match (&cursor, req.reverse) {
                (Bound::Unbounded, _) => true,
                (Bound::Included(c), false) => key >= c,
                (Bound::Excluded(c), false) => key > c,
                (Bound::Included(c), true) => key <= c,
                (Bound::Excluded(c), true) => key < c,
            };
            if !in_range {
                overlay_add = None;
            }
        }

        Ok(Some(SourceFetch {
            state: Rc::clone(&self.state),
            index_sort,
            cursor,
            reverse: req.reverse,
            constraint: req.constraint.clone(),
            predicate,
            overlay_add,
            overlay_remove,
            done: false,
        }))
    }
}

/// Finds the nearest stored row before `key` (after it when reading in
/// reverse) that matches the constraint and filters.
fn neighbor(
    index: &Index,
    key: &IndexKey,
    reverse: bool,
    constraint: Option<&Constraint>,
    skip: Option<&IndexKey>,
    matches: &dyn Fn(&Row) -> bool,
) -> Option<IndexKey> {
    let candidates: Box<dyn Iterator<Item = (&IndexKey, &Row)>> = if reverse {
        Box::new(index.data.range((Bound::Excluded(key), Bound::Unbounded)))
    } else {
        Box::new(
            index
                .data
                .range((Bound::Unbounded, Bound::Excluded(key)))
                .rev(),
        )
    };
    for (k, row) in candidates {
        if constraint.map_or(false, |c| !c.matches(row)) {
            return None;
        }
        if Some(k) == skip || !matches(row) {
            continue;
        }
        return Some(k.clone());
    }
    None
}

impl Input for SourceInput {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&self, req: FetchRequest) -> Result<Stream<'_>> {
        Ok(match self.open(&req)? {
            Some(fetch) => Box::new(fetch),
            None => Box::new(core::iter::empty()),
        })
    }

    fn cleanup(&self, req: FetchRequest) -> Result<Stream<'_>> {
        self.fetch(req)
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        if let Some(Some(conn)) = self.state.borrow_mut().connections.get_mut(self.index) {
            conn.output = Some(output);
        }
    }

    fn destroy(&self) {
        self.state.borrow_mut().disconnect(self.index);
    }
}

/// Lazy cursor over one index.
///
/// Each step re-borrows the source only to read the next entry, so outputs
/// may fetch (and the source may create indexes) while a stream is open.
struct SourceFetch {
    state: Rc<RefCell<SourceState>>,
    index_sort: Sort,
    cursor: Bound<IndexKey>,
    reverse: bool,
    constraint: Option<Constraint>,
    predicate: Option<Predicate>,
    overlay_add: Option<(IndexKey, Row)>,
    overlay_remove: Option<IndexKey>,
    done: bool,
}

impl SourceFetch {
    fn next_stored(&self) -> Option<(IndexKey, Row)> {
        let state = self.state.borrow();
        let index = state.indexes.get(&self.index_sort)?;
        let entry = if self.reverse {
            index
                .data
                .range((Bound::Unbounded, self.cursor.clone()))
                .next_back()
        } else {
            index
                .data
                .range((self.cursor.clone(), Bound::Unbounded))
                .next()
        };
        entry.map(|(k, row)| (k.clone(), row.clone()))
    }
}

impl Iterator for SourceFetch {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        while !self.done {
            let stored = self.next_stored();

            let add_first = match (&self.overlay_add, &stored) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some((add, _)), Some((key, _))) => {
                    if self.reverse {
                        add >= key
                    } else {
                        add <= key
                    }
                }
            };
            if add_first {
                if let Some((_, row)) = self.overlay_add.take() {
                    return Some(Node::new(row));
                }
            }

            let Some((key, row)) = stored else {
                self.done = true;
                break;
            };
            if self.overlay_remove.as_ref() == Some(&key) {
                self.overlay_remove = None;
                self.cursor = Bound::Excluded(key);
                continue;
            }
            self.cursor = Bound::Excluded(key);
            if let Some(constraint) = &self.constraint {
                if !constraint.matches(&row) {
                    self.done = true;
                    break;
                }
            }
            if let Some(predicate) = &self.predicate {
                if !predicate(&row) {
                    continue;
                }
            }
            return Some(Node::new(row));
        }
        None
    }
}
