//! Incremental limit operator.
//!
//! `Take` keeps the first `limit` nodes of its input, optionally once per
//! partition (unique value of a partition key). It stores only a count and
//! a *bound* per partition: the last row admitted to the window. Pushes are
//! evaluated against the bound, and rows entering or leaving the window are
//! found with point fetches against the input around the bound.

use crate::change::Change;
use crate::node::Node;
use crate::operator::{first, take, Basis, Constraint, FetchRequest, Input, Output, OutputSlot, Stream};
use crate::schema::SourceSchema;
use core::cmp::Ordering;
use hashbrown::HashMap;
use rill_core::{Error, Result, Row, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{trace, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
struct TakeState {
    size: usize,
    bound: Option<Row>,
}

#[derive(Debug, Default)]
struct TakeStorage {
    partitions: HashMap<Vec<Value>, TakeState>,
    /// Largest bound of any partition.
    max_bound: Option<Row>,
}

/// A partition's state together with what is needed to update it.
struct Located {
    key: Vec<Value>,
    state: TakeState,
    max_bound: Option<Row>,
    constraint: Option<Constraint>,
}

/// The limit operator.
pub struct Take {
    input: Rc<dyn Input>,
    limit: usize,
    partition_key: Option<Vec<String>>,
    storage: RefCell<TakeStorage>,
    output: OutputSlot,
}

impl Take {
    /// Creates a take over `input`, registering itself as the input's output.
    ///
    /// The input's ordering must include its primary key.
    pub fn new(
        input: Rc<dyn Input>,
        limit: usize,
        partition_key: Option<Vec<String>>,
    ) -> Result<Rc<Self>> {
        input.schema().ensure_sort_includes_primary_key()?;
        let take = Rc::new(Self {
            input,
            limit,
            partition_key,
            storage: RefCell::new(TakeStorage::default()),
            output: OutputSlot::new(),
        });
        let weak: Weak<Take> = Rc::downgrade(&take);
        take.input.set_output(weak);
        Ok(take)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        self.input.schema().compare_rows(a, b)
    }

    fn matches_partition_key(&self, constraint: Option<&Constraint>) -> bool {
        match (constraint, &self.partition_key) {
            (None, None) => true,
            (Some(c), Some(key)) => c.has_columns(key),
            _ => false,
        }
    }

    fn key_from_constraint(&self, constraint: Option<&Constraint>) -> Vec<Value> {
        match (&self.partition_key, constraint) {
            (Some(key), Some(c)) => key
                .iter()
                .map(|column| c.get(column).cloned().unwrap_or(Value::Null))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn key_from_row(&self, row: &Row) -> Vec<Value> {
        self.partition_key
            .as_ref()
            .map(|key| row.values_for(key))
            .unwrap_or_default()
    }

    fn locate(&self, row: &Row) -> Option<Located> {
        let key = self.key_from_row(row);
        let storage = self.storage.borrow();
        let state = storage.partitions.get(&key)?.clone();
        Some(Located {
            key,
            state,
            max_bound: storage.max_bound.clone(),
            constraint: self
                .partition_key
                .as_ref()
                .map(|columns| Constraint::from_row(columns, row)),
        })
    }

    fn set_state(&self, key: Vec<Value>, size: usize, bound: Option<Row>, max_bound: Option<&Row>) {
        let mut storage = self.storage.borrow_mut();
        if let Some(b) = &bound {
            let raise = max_bound.map_or(true, |max| self.compare(b, max) == Ordering::Greater);
            if raise {
                storage.max_bound = Some(b.clone());
            }
        }
        storage.partitions.insert(key, TakeState { size, bound });
    }

    fn fetch_around(&self, bound: &Row, basis: Basis, constraint: &Option<Constraint>, reverse: bool) -> Result<Stream<'_>> {
        let mut req = FetchRequest::new().with_start(bound.clone(), basis);
        req.constraint = constraint.clone();
        req.reverse = reverse;
        self.input.fetch(req)
    }

    fn initial_fetch(&self, req: FetchRequest, key: Vec<Value>) -> Result<Stream<'_>> {
        if req.start.is_some() || req.reverse {
            return Err(Error::invalid_operation(
                "take hydration must read its input from the start",
            ));
        }
        if self.limit == 0 {
            return Ok(Box::new(core::iter::empty()));
        }
        let input = self.input.fetch(req)?;
        Ok(Box::new(Hydration {
            take: self,
            input,
            key: Some(key),
            size: 0,
            bound: None,
        }))
    }

    fn push_edit(&self, old_node: Node, node: Node) -> Result<()> {
        if let Some(columns) = &self.partition_key {
            let moved = columns
                .iter()
                .any(|c| old_node.row.get(c) != node.row.get(c));
            if moved {
                self.push(Change::Remove(old_node))?;
                return self.push(Change::Add(node));
            }
        }

        let Some(Located { key, state, max_bound, constraint }) = self.locate(&old_node.row) else {
            return Ok(());
        };
        let Some(bound) = state.bound.clone() else {
            return Err(Error::invalid_operation("take bound should be set"));
        };
        let old_cmp = self.compare(&old_node.row, &bound);
        let new_cmp = self.compare(&node.row, &bound);
        let max_bound = max_bound.as_ref();

        match (old_cmp, new_cmp) {
            (Ordering::Equal, Ordering::Equal) => self.output.push(Change::Edit { old_node, node }),
            (Ordering::Equal, Ordering::Less) => {
                // The bound moved down; the row before the old bound position
                // may now be the last one in the window.
                let new_bound = if self.limit == 1 {
                    node.row.clone()
                } else {
                    first(self.fetch_around(&bound, Basis::After, &constraint, true)?)
                        .ok_or_else(|| missing("row before bound"))?
                        .row
                };
                self.set_state(key, state.size, Some(new_bound), max_bound);
                self.output.push(Change::Edit { old_node, node })
            }
            (Ordering::Equal, Ordering::Greater) => {
                let next = first(self.fetch_around(&bound, Basis::At, &constraint, false)?)
                    .ok_or_else(|| missing("row at bound"))?;
                if self.compare(&next.row, &node.row) == Ordering::Equal {
                    self.set_state(key, state.size, Some(node.row.clone()), max_bound);
                    return self.output.push(Change::Edit { old_node, node });
                }
                self.set_state(key, state.size, Some(next.row.clone()), max_bound);
                self.output.push(Change::Remove(old_node))?;
                self.output.push(Change::Add(next))
            }
            (Ordering::Greater, Ordering::Greater) => Ok(()),
            (Ordering::Greater, _) => {
                let nodes = take(self.fetch_around(&bound, Basis::At, &constraint, true)?, 2);
                let mut nodes = nodes.into_iter();
                let evicted = nodes.next().ok_or_else(|| missing("bound row"))?;
                let new_bound = nodes.next().ok_or_else(|| missing("row before bound"))?;
                self.set_state(key, state.size, Some(new_bound.row), max_bound);
                self.output.push(Change::Remove(evicted))?;
                self.output.push(Change::Add(node))
            }
            (Ordering::Less, Ordering::Greater) => {
                let next = first(self.fetch_around(&bound, Basis::After, &constraint, false)?)
                    .ok_or_else(|| missing("row after bound"))?;
                if self.compare(&next.row, &node.row) == Ordering::Equal {
                    self.set_state(key, state.size, Some(node.row.clone()), max_bound);
                    return self.output.push(Change::Edit { old_node, node });
                }
                self.set_state(key, state.size, Some(next.row.clone()), max_bound);
                self.output.push(Change::Remove(old_node))?;
                self.output.push(Change::Add(next))
            }
            (Ordering::Less, _) => self.output.push(Change::Edit { old_node, node }),
        }
    }

    fn push_add(&self, node: Node, at: Located) -> Result<()> {
        let Located { key, state, max_bound, constraint } = at;
        let max_bound = max_bound.as_ref();
        if state.size < self.limit {
            let bound = match state.bound {
                Some(b) if self.compare(&b, &node.row) != Ordering::Less => b,
                _ => node.row.clone(),
            };
            self.set_state(key, state.size + 1, Some(bound), max_bound);
            return self.output.push(Change::Add(node));
        }
        let Some(bound) = state.bound else {
            return Ok(());
        };
        if self.compare(&node.row, &bound) != Ordering::Less {
            return Ok(());
        }

        // The new row displaces the bound.
        let (evicted, before_bound) = if self.limit == 1 {
            let evicted = first(self.fetch_around(&bound, Basis::At, &constraint, false)?);
            (evicted, None)
        } else {
            let mut nodes = take(self.fetch_around(&bound, Basis::At, &constraint, true)?, 2).into_iter();
            (nodes.next(), nodes.next())
        };
        let evicted = evicted.ok_or_else(|| missing("bound row"))?;
        let new_bound = match before_bound {
            Some(b) if self.compare(&node.row, &b.row) != Ordering::Greater => b.row,
            _ => node.row.clone(),
        };
        trace!(evicted = ?evicted.row, "take evicted bound");
        self.set_state(key, state.size, Some(new_bound), max_bound);
        self.output.push(Change::Remove(evicted))?;
        self.output.push(Change::Add(node))
    }

    fn push_remove(&self, node: Node, at: Located) -> Result<()> {
        let Located { key, state, max_bound, constraint } = at;
        let max_bound = max_bound.as_ref();
        let Some(bound) = state.bound else {
            return Ok(());
        };
        if self.compare(&node.row, &bound) == Ordering::Greater {
            return Ok(());
        }

        // Find the replacement: the first row past the bound, or failing
        // that the last row still inside the window.
        let mut candidate: Option<(Node, bool)> =
            first(self.fetch_around(&bound, Basis::After, &constraint, true)?).map(|before| {
                let past = self.compare(&before.row, &bound) == Ordering::Greater;
                (before, past)
            });
        if !candidate.as_ref().map_or(false, |(_, past)| *past) {
            for next in self.fetch_around(&bound, Basis::At, &constraint, false)? {
                let past = self.compare(&next.row, &bound) == Ordering::Greater;
                candidate = Some((next, past));
                if past {
                    break;
                }
            }
        }

        match candidate {
            Some((backfill, true)) => {
                self.set_state(key, state.size, Some(backfill.row.clone()), max_bound);
                self.output.push(Change::Remove(node))?;
                self.output.push(Change::Add(backfill))
            }
            other => {
                let bound = other.map(|(n, _)| n.row);
                self.set_state(key, state.size.saturating_sub(1), bound, max_bound);
                self.output.push(Change::Remove(node))
            }
        }
    }
}

fn missing(what: &str) -> Error {
    Error::invalid_operation(format!("take input is missing the {what}"))
}

impl Input for Take {
    fn schema(&self) -> &SourceSchema {
        self.input.schema()
    }

    fn fetch(&self, req: FetchRequest) -> Result<Stream<'_>> {
        if self.partition_key.is_none() && req.constraint.is_some() {
            return Err(Error::invalid_operation(
                "unpartitioned take cannot be fetched with a constraint",
            ));
        }
        if self.partition_key.is_none()
            || (req.constraint.is_some() && self.matches_partition_key(req.constraint.as_ref()))
        {
            let key = self.key_from_constraint(req.constraint.as_ref());
            let bound = self
                .storage
                .borrow()
                .partitions
                .get(&key)
                .map(|state| state.bound.clone());
            return match bound {
                None => self.initial_fetch(req, key),
                Some(None) => Ok(Box::new(core::iter::empty())),
                Some(Some(bound)) => {
                    let input = self.input.fetch(req)?;
                    Ok(Box::new(input.take_while(move |node| {
                        self.compare(&bound, &node.row) != Ordering::Less
                    })))
                }
            };
        }

        // Partitioned, but the request does not select one partition: bound
        // the scan by the largest bound and check each row's own partition.
        let Some(max_bound) = self.storage.borrow().max_bound.clone() else {
            return Ok(Box::new(core::iter::empty()));
        };
        let input = self.input.fetch(req)?;
        Ok(Box::new(
            input
                .take_while(move |node| self.compare(&node.row, &max_bound) != Ordering::Greater)
                .filter(move |node| {
                    let key = self.key_from_row(&node.row);
                    let storage = self.storage.borrow();
                    storage
                        .partitions
                        .get(&key)
                        .and_then(|state| state.bound.as_ref())
                        .map_or(false, |bound| self.compare(bound, &node.row) != Ordering::Less)
                }),
        ))
    }

    fn cleanup(&self, req: FetchRequest) -> Result<Stream<'_>> {
        if req.start.is_some() || !self.matches_partition_key(req.constraint.as_ref()) {
            return Err(Error::invalid_operation(
                "take cleanup must select exactly one partition",
            ));
        }
        let key = self.key_from_constraint(req.constraint.as_ref());
        self.storage.borrow_mut().partitions.remove(&key);
        Ok(Box::new(self.input.cleanup(req)?.take(self.limit)))
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        self.output.set(output);
    }

    fn destroy(&self) {
        self.output.clear();
        self.input.destroy();
    }
}

impl Output for Take {
    fn push(&self, change: Change) -> Result<()> {
        if let Change::Edit { old_node, node } = change {
            return self.push_edit(old_node, node);
        }
        let Some(at) = self.locate(change.row()) else {
            return Ok(());
        };
        match change {
            Change::Add(node) => self.push_add(node, at),
            Change::Remove(node) => self.push_remove(node, at),
            Change::Child { row, child } => match &at.state.bound {
                Some(bound) if self.compare(&row, bound) != Ordering::Greater => {
                    self.output.push(Change::Child { row, child })
                }
                _ => Ok(()),
            },
            Change::Edit { .. } => Ok(()),
        }
    }
}

/// The first fetch of a partition. Records the partition's state once the
/// window is complete, even when the consumer stops reading early.
struct Hydration<'a> {
    take: &'a Take,
    input: Stream<'a>,
    key: Option<Vec<Value>>,
    size: usize,
    bound: Option<Row>,
}

impl Hydration<'_> {
    fn finish(&mut self) {
        if let Some(key) = self.key.take() {
            let max_bound = self.take.storage.borrow().max_bound.clone();
            self.take
                .set_state(key, self.size, self.bound.take(), max_bound.as_ref());
        }
    }
}

impl Iterator for Hydration<'_> {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        if self.key.is_none() {
            return None;
        }
        if self.size == self.take.limit {
            self.finish();
            return None;
        }
        match self.input.next() {
            Some(node) => {
                self.size += 1;
                self.bound = Some(node.row.clone());
                if self.size == self.take.limit {
                    self.finish();
                }
                Some(node)
            }
            None => {
                self.finish();
                None
            }
        }
    }
}

impl Drop for Hydration<'_> {
    fn drop(&mut self) {
        if self.key.is_none() {
            return;
        }
        let yielded = self.size;
        while self.size < self.take.limit {
            let Some(node) = self.input.next() else {
                break;
            };
            self.size += 1;
            self.bound = Some(node.row);
        }
        warn!(
            yielded,
            size = self.size,
            limit = self.take.limit,
            "take hydration abandoned early; consumed remaining window"
        );
        self.finish();
    }
}
