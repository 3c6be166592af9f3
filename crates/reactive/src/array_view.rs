//! Materialization of a pipeline's output.
//!
//! An [`ArrayView`] is the output of the last operator of a pipeline. It
//! keeps the pipeline's result as a tree of sorted entry lists, applies every
//! pushed change to it, and notifies its listeners once per [`flush`]: pushes
//! alone never notify.
//!
//! Relationships of a hidden schema are collapsed: the hidden rows are not
//! materialized and their children are placed directly in the enclosing
//! relationship. This is how junction tables appear as a single relationship.
//!
//! [`flush`]: ArrayView::flush

use crate::subscription::{SubscriptionId, SubscriptionManager};
use crate::view::{Entry, Format, View};
use rill_core::{Error, Result, Row};
use rill_incremental::{Change, FetchRequest, Input, Node, Output, SourceSchema};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// A materialized, listenable view over an operator pipeline.
pub struct ArrayView {
    input: Rc<dyn Input>,
    schema: SourceSchema,
    format: Format,
    root: RefCell<View>,
    hydrated: Cell<bool>,
    dirty: Cell<bool>,
    listeners: RefCell<SubscriptionManager>,
    on_destroy: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl std::fmt::Debug for ArrayView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayView")
            .field("schema", &self.schema)
            .field("format", &self.format)
            .field("hydrated", &self.hydrated.get())
            .field("dirty", &self.dirty.get())
            .finish_non_exhaustive()
    }
}

impl ArrayView {
    /// Creates a view over `input` and registers it as the input's output.
    pub fn new(input: Rc<dyn Input>, format: Format) -> Result<Rc<Self>> {
        let schema = input.schema().clone();
        schema.ensure_sort_includes_primary_key()?;
        let view = Rc::new(Self {
            input,
            schema,
            root: RefCell::new(View::empty(&format)),
            format,
            hydrated: Cell::new(false),
            dirty: Cell::new(false),
            listeners: RefCell::new(SubscriptionManager::new()),
            on_destroy: RefCell::new(None),
        });
        let weak: Weak<ArrayView> = Rc::downgrade(&view);
        view.input.set_output(weak);
        Ok(view)
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated.get()
    }

    /// A copy of the current data.
    pub fn data(&self) -> View {
        self.root.borrow().clone()
    }

    /// Reads the initial result and notifies listeners. May be called once.
    pub fn hydrate(&self) -> Result<()> {
        if self.hydrated.get() {
            return Err(Error::AlreadyHydrated);
        }
        self.hydrated.set(true);
        self.dirty.set(true);
        let nodes: Vec<Node> = self.input.fetch(FetchRequest::new())?.collect();
        debug!(table = %self.schema.table_name, rows = nodes.len(), "hydrating view");
        {
            let mut root = self.root.borrow_mut();
            for node in nodes {
                apply_change(&mut root, Change::Add(node), &self.schema, &self.format)?;
            }
        }
        self.flush();
        Ok(())
    }

    /// Notifies every listener once if changes were pushed since the last
    /// flush.
    pub fn flush(&self) {
        if !self.dirty.replace(false) {
            return;
        }
        let callbacks = self.listeners.borrow().callbacks();
        trace!(table = %self.schema.table_name, listeners = callbacks.len(), "flushing view");
        let data = self.data();
        for callback in callbacks {
            callback(&data);
        }
    }

    /// Registers a listener. It is called right away when the view is
    /// already hydrated.
    pub fn add_listener<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&View) + 'static,
    {
        let id = self.listeners.borrow_mut().subscribe(listener);
        if self.hydrated.get() {
            let data = self.data();
            self.listeners.borrow().notify(id, &data);
        }
        id
    }

    /// Returns true if the listener was registered.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.borrow_mut().unsubscribe(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Sets a callback run once when the view is destroyed.
    pub fn set_on_destroy<F: FnOnce() + 'static>(&self, f: F) {
        *self.on_destroy.borrow_mut() = Some(Box::new(f));
    }

    /// Moves the listeners and destroy callback of `other` to this view.
    pub fn take_over(&self, other: &ArrayView) {
        let listeners = core::mem::take(&mut *other.listeners.borrow_mut());
        *self.listeners.borrow_mut() = listeners;
        let on_destroy = other.on_destroy.borrow_mut().take();
        *self.on_destroy.borrow_mut() = on_destroy;
    }

    /// Detaches the view from its pipeline.
    pub fn destroy(&self) {
        self.input.destroy();
        self.listeners.borrow_mut().clear();
        let on_destroy = self.on_destroy.borrow_mut().take();
        if let Some(f) = on_destroy {
            f();
        }
    }
}

impl Output for ArrayView {
    fn push(&self, change: Change) -> Result<()> {
        self.dirty.set(true);
        let mut root = self.root.borrow_mut();
        apply_change(&mut root, change, &self.schema, &self.format)
    }
}

fn corrupt(message: &str) -> Error {
    Error::invalid_operation(format!("view out of sync: {message}"))
}

fn find(entries: &[Entry], row: &Row, schema: &SourceSchema) -> core::result::Result<usize, usize> {
    entries.binary_search_by(|entry| schema.compare_rows(&entry.row, row))
}

fn child_schema<'a>(schema: &'a SourceSchema, name: &str) -> Result<&'a SourceSchema> {
    schema
        .relationships
        .get(name)
        .ok_or_else(|| corrupt(&format!("unknown relationship {name}")))
}

fn child_format(format: &Format, name: &str) -> Format {
    format.relationships.get(name).cloned().unwrap_or_default()
}

/// Builds an entry for a node, materializing its relationships.
fn make_entry(node: Node, schema: &SourceSchema, format: &Format) -> Result<Entry> {
    let mut entry = Entry::new(node.row);
    for (name, children) in node.relationships {
        let schema = child_schema(schema, &name)?;
        let format = child_format(format, &name);
        let mut view = View::empty(&format);
        for child in children {
            apply_change(&mut view, Change::Add(child), schema, &format)?;
        }
        entry.relationships.insert(name, view);
    }
    Ok(entry)
}

/// Applies a change to one view slot.
fn apply_change(view: &mut View, change: Change, schema: &SourceSchema, format: &Format) -> Result<()> {
    if schema.is_hidden {
        return match change {
            Change::Add(node) => splice_hidden(view, node, schema, format, false),
            Change::Remove(node) => splice_hidden(view, node, schema, format, true),
            // Edits that change a hidden row's relationships arrive split into
            // remove and add.
            Change::Edit { .. } => Ok(()),
            Change::Child { child, .. } => {
                let schema = child_schema(schema, &child.relationship_name)?;
                apply_change(view, *child.change, schema, format)
            }
        };
    }

    match (view, change) {
        (View::Singular(slot), Change::Add(node)) => {
            if slot.is_some() {
                return Err(corrupt("single output already exists"));
            }
            *slot = Some(Box::new(make_entry(node, schema, format)?));
        }
        (View::List(entries), Change::Add(node)) => {
            let pos = match find(entries, &node.row, schema) {
                Ok(_) => return Err(corrupt("node already exists")),
                Err(pos) => pos,
            };
            entries.insert(pos, make_entry(node, schema, format)?);
        }
        (View::Singular(slot), Change::Remove(_)) => {
            if slot.take().is_none() {
                return Err(corrupt("node does not exist"));
            }
        }
        (View::List(entries), Change::Remove(node)) => {
            let pos = find(entries, &node.row, schema).map_err(|_| corrupt("node does not exist"))?;
            entries.remove(pos);
        }
        (view, Change::Child { row, child }) => {
            let existing = match view {
                View::Singular(slot) => slot.as_deref_mut(),
                View::List(entries) => match find(entries, &row, schema) {
                    Ok(pos) => entries.get_mut(pos),
                    Err(_) => None,
                },
            }
            .ok_or_else(|| corrupt("node does not exist"))?;
            let name = child.relationship_name;
            let schema = child_schema(schema, &name)?;
            let format = child_format(format, &name);
            let slot = existing
                .relationships
                .entry(name)
                .or_insert_with(|| View::empty(&format));
            apply_change(slot, *child.change, schema, &format)?;
        }
        (View::Singular(slot), Change::Edit { node, .. }) => {
            let existing = slot.as_deref_mut().ok_or_else(|| corrupt("node does not exist"))?;
            for (column, value) in node.row.iter() {
                existing.row.set(column, value.clone());
            }
        }
        (View::List(entries), Change::Edit { old_node, node }) => {
            let pos = find(entries, &old_node.row, schema).map_err(|_| corrupt("node does not exist"))?;
            if schema.compare_rows(&old_node.row, &node.row) == Ordering::Equal {
                entries[pos].row = node.row;
            } else {
                let mut entry = entries.remove(pos);
                entry.row = node.row;
                let pos = match find(entries, &entry.row, schema) {
                    Ok(_) => return Err(corrupt("node already exists")),
                    Err(pos) => pos,
                };
                entries.insert(pos, entry);
            }
        }
    }
    Ok(())
}

/// Adds or removes the children of a hidden node directly in `view`.
fn splice_hidden(view: &mut View, node: Node, schema: &SourceSchema, format: &Format, remove: bool) -> Result<()> {
    for (name, children) in node.relationships {
        let schema = child_schema(schema, &name)?;
        for child in children {
            let change = if remove {
                Change::Remove(child)
            } else {
                Change::Add(child)
            };
            apply_change(view, change, schema, format)?;
        }
    }
    Ok(())
}
