//! Hierarchical join.
//!
//! Unlike a relational join, `Join` does not flatten: each parent node gets
//! a relationship holding the child nodes whose child key equals the
//! parent's parent key.

use crate::change::Change;
use crate::node::Node;
use crate::operator::{Constraint, FetchRequest, Input, Output, OutputSlot, Stream};
use crate::schema::SourceSchema;
use hashbrown::{HashMap, HashSet};
use rill_core::{values_equal, Error, Result, Row, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::trace;

/// Arguments of [`Join::new`].
pub struct JoinArgs {
    pub parent: Rc<dyn Input>,
    pub child: Rc<dyn Input>,
    /// Parent columns; the nth corresponds to the nth child column.
    pub parent_key: Vec<String>,
    pub child_key: Vec<String>,
    pub relationship_name: String,
    pub hidden: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Fetch,
    Cleanup,
}

#[derive(Clone, Copy)]
enum Side {
    Parent,
    Child,
}

/// Routes pushes from one of the join's inputs back to the join.
struct Port {
    join: Weak<Join>,
    side: Side,
}

impl Output for Port {
    fn push(&self, change: Change) -> Result<()> {
        let Some(join) = self.join.upgrade() else {
            return Ok(());
        };
        match self.side {
            Side::Parent => join.push_parent(change),
            Side::Child => join.push_child(change),
        }
    }
}

/// The join operator.
pub struct Join {
    parent: Rc<dyn Input>,
    child: Rc<dyn Input>,
    parent_key: Vec<String>,
    child_key: Vec<String>,
    relationship_name: String,
    schema: SourceSchema,
    /// Parent primary keys seen for each join key value. A child partition
    /// is only cleaned up when its last parent goes away.
    parents: RefCell<HashMap<Vec<Value>, HashSet<Vec<Value>>>>,
    output: OutputSlot,
    ports: [Rc<Port>; 2],
}

impl Join {
    pub fn new(args: JoinArgs) -> Result<Rc<Self>> {
        let JoinArgs {
            parent,
            child,
            parent_key,
            child_key,
            relationship_name,
            hidden,
        } = args;
        if Rc::ptr_eq(&parent, &child) {
            return Err(Error::invalid_operation(
                "parent and child must be different operators",
            ));
        }
        if parent_key.len() != child_key.len() || parent_key.is_empty() {
            return Err(Error::invalid_operation(
                "parent and child keys must have the same, non-zero length",
            ));
        }

        let mut schema = parent.schema().clone();
        schema.is_hidden = hidden;
        schema
            .relationships
            .insert(relationship_name.clone(), child.schema().clone());

        let join = Rc::new_cyclic(|weak: &Weak<Join>| Self {
            parent,
            child,
            parent_key,
            child_key,
            relationship_name,
            schema,
            parents: RefCell::new(HashMap::new()),
            output: OutputSlot::new(),
            ports: [
                Rc::new(Port {
                    join: weak.clone(),
                    side: Side::Parent,
                }),
                Rc::new(Port {
                    join: weak.clone(),
                    side: Side::Child,
                }),
            ],
        });
        let [parent_port, child_port] = &join.ports;
        let parent_port: Weak<Port> = Rc::downgrade(parent_port);
        let child_port: Weak<Port> = Rc::downgrade(child_port);
        join.parent.set_output(parent_port);
        join.child.set_output(child_port);
        Ok(join)
    }

    pub fn relationship_name(&self) -> &str {
        &self.relationship_name
    }

    fn child_constraint(&self, parent_row: &Row) -> Constraint {
        Constraint::from_pairs(
            self.child_key
                .iter()
                .zip(&self.parent_key)
                .map(|(child, parent)| (child.clone(), parent_row.get(parent).clone())),
        )
    }

    fn parent_constraint(&self, child_row: &Row) -> Constraint {
        Constraint::from_pairs(
            self.parent_key
                .iter()
                .zip(&self.child_key)
                .map(|(parent, child)| (parent.clone(), child_row.get(child).clone())),
        )
    }

    /// Attaches the matching children to a parent node.
    fn process_parent(&self, parent: Node, mode: Mode) -> Result<Node> {
        let join_key = parent.row.values_for(&self.parent_key);
        let parent_pk = self.parent.schema().primary_key.key_of(&parent.row);

        // Another parent with the same join key still needs the child state.
        let method = match mode {
            Mode::Fetch => Mode::Fetch,
            Mode::Cleanup => {
                let shared = self
                    .parents
                    .borrow()
                    .get(&join_key)
                    .map_or(false, |pks| pks.len() > 1);
                if shared {
                    Mode::Fetch
                } else {
                    Mode::Cleanup
                }
            }
        };

        let req = FetchRequest::new().with_constraint(self.child_constraint(&parent.row));
        // Children are materialized per parent, so hydration memory grows
        // with the fan-out of the relationship.
        let children: Vec<Node> = match method {
            Mode::Fetch => self.child.fetch(req)?.collect(),
            Mode::Cleanup => self.child.cleanup(req)?.collect(),
        };

        {
            let mut parents = self.parents.borrow_mut();
            match mode {
                Mode::Fetch => {
                    parents.entry(join_key).or_default().insert(parent_pk);
                }
                Mode::Cleanup => {
                    if let Some(pks) = parents.get_mut(&join_key) {
                        pks.remove(&parent_pk);
                        if pks.is_empty() {
                            parents.remove(&join_key);
                        }
                    }
                }
            }
        }

        let mut node = parent;
        node.relationships
            .insert(self.relationship_name.clone(), children);
        Ok(node)
    }

    fn keys_equal(a: &Row, b: &Row, key: &[String]) -> bool {
        key.iter().all(|column| values_equal(a.get(column), b.get(column)))
    }

    fn push_parent(&self, change: Change) -> Result<()> {
        match change {
            Change::Add(node) => {
                let node = self.process_parent(node, Mode::Fetch)?;
                self.output.push(Change::Add(node))
            }
            Change::Remove(node) => {
                let node = self.process_parent(node, Mode::Cleanup)?;
                self.output.push(Change::Remove(node))
            }
            Change::Child { .. } => self.output.push(change),
            Change::Edit { old_node, node } => {
                if Self::keys_equal(&old_node.row, &node.row, &self.parent_key) {
                    let old_node = self.process_parent(old_node, Mode::Cleanup)?;
                    let node = self.process_parent(node, Mode::Fetch)?;
                    self.output.push(Change::Edit { old_node, node })
                } else {
                    self.push_parent(Change::Remove(old_node))?;
                    self.push_parent(Change::Add(node))
                }
            }
        }
    }

    /// Wraps a child change in a `Child` change for every matching parent.
    fn push_child_change(&self, child_row: &Row, change: Change) -> Result<()> {
        let req = FetchRequest::new().with_constraint(self.parent_constraint(child_row));
        let parents: Vec<Node> = self.parent.fetch(req)?.collect();
        trace!(
            relationship = %self.relationship_name,
            parents = parents.len(),
            kind = change.kind(),
            "join child push"
        );
        for parent in parents {
            self.output.push(Change::child(
                parent.row,
                self.relationship_name.clone(),
                change.clone(),
            ))?;
        }
        Ok(())
    }

    fn push_child(&self, change: Change) -> Result<()> {
        match &change {
            Change::Add(node) | Change::Remove(node) => {
                let row = node.row.clone();
                self.push_child_change(&row, change)
            }
            Change::Child { row, .. } => {
                let row = row.clone();
                self.push_child_change(&row, change)
            }
            Change::Edit { old_node, node } => {
                if Self::keys_equal(&old_node.row, &node.row, &self.child_key) {
                    let row = node.row.clone();
                    self.push_child_change(&row, change)
                } else {
                    let (old_row, row) = (old_node.row.clone(), node.row.clone());
                    let (old_node, node) = (old_node.clone(), node.clone());
                    self.push_child_change(&old_row, Change::Remove(old_node))?;
                    self.push_child_change(&row, Change::Add(node))
                }
            }
        }
    }

    /// Holds every parent and its children at once; memory grows with the
    /// number of parents times their fan-out.
    fn process_all(&self, parents: Stream<'_>, mode: Mode) -> Result<Vec<Node>> {
        let parents: Vec<Node> = parents.collect();
        parents
            .into_iter()
            .map(|parent| self.process_parent(parent, mode))
            .collect()
    }
}

impl Input for Join {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&self, req: FetchRequest) -> Result<Stream<'_>> {
        let nodes = self.process_all(self.parent.fetch(req)?, Mode::Fetch)?;
        Ok(Box::new(nodes.into_iter()))
    }

    fn cleanup(&self, req: FetchRequest) -> Result<Stream<'_>> {
        let nodes = self.process_all(self.parent.cleanup(req)?, Mode::Cleanup)?;
        Ok(Box::new(nodes.into_iter()))
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        self.output.set(output);
    }

    fn destroy(&self) {
        self.output.clear();
        self.parent.destroy();
        self.child.destroy();
    }
}

impl core::fmt::Debug for Join {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Join")
            .field("relationship_name", &self.relationship_name)
            .field("parent_key", &self.parent_key)
            .field("child_key", &self.child_key)
            .field("join_keys", &self.parents.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SourceChange;
    use crate::operators::Take;
    use crate::source::TableSource;
    use rill_core::{row, Sort, TableBuilder, TableSpec, ValueType};

    fn spec(name: &str, columns: &[&str]) -> TableSpec {
        let mut builder = TableBuilder::new(name).unwrap();
        for c in columns {
            builder = builder.add_column(*c, ValueType::Number).unwrap();
        }
        builder.add_primary_key(&["id"]).unwrap().build().unwrap()
    }

    #[derive(Default)]
    struct Catch {
        changes: RefCell<Vec<Change>>,
    }

    impl Output for Catch {
        fn push(&self, change: Change) -> Result<()> {
            self.changes.borrow_mut().push(change);
            Ok(())
        }
    }

    struct Fixture {
        issues: TableSource,
        comments: TableSource,
        join: Rc<Join>,
        catch: Rc<Catch>,
    }

    fn fixture(comment_limit: Option<usize>) -> Fixture {
        let issues = TableSource::new(spec("issue", &["id", "owner"]));
        let comments = TableSource::new(spec("comment", &["id", "issue"]));
        for (id, owner) in [(1, 10), (2, 20), (3, 10)] {
            issues
                .push(SourceChange::Add(row! { "id" => id, "owner" => owner }))
                .unwrap();
        }
        for (id, issue) in [(100, 1), (101, 1), (102, 2), (103, 1)] {
            comments
                .push(SourceChange::Add(row! { "id" => id, "issue" => issue }))
                .unwrap();
        }
        let parent = issues.connect(Sort::asc(["id"]), None).unwrap();
        let comment_input = comments.connect(Sort::asc(["id"]), None).unwrap();
        let child: Rc<dyn Input> = match comment_limit {
            Some(limit) => Take::new(comment_input, limit, Some(vec!["issue".to_string()])).unwrap(),
            None => comment_input,
        };
        let join = Join::new(JoinArgs {
            parent,
            child,
            parent_key: vec!["id".to_string()],
            child_key: vec!["issue".to_string()],
            relationship_name: "comments".to_string(),
            hidden: false,
        })
        .unwrap();
        let catch = Rc::new(Catch::default());
        let weak: Weak<Catch> = Rc::downgrade(&catch);
        join.set_output(weak);
        Fixture {
            issues,
            comments,
            join,
            catch,
        }
    }

    fn child_ids(node: &Node) -> Vec<Value> {
        node.children("comments")
            .iter()
            .map(|c| c.row.get("id").clone())
            .collect()
    }

    #[test]
    fn test_fetch_attaches_children() {
        let f = fixture(None);
        let nodes: Vec<Node> = f.join.fetch(FetchRequest::new()).unwrap().collect();
        assert_eq!(nodes.len(), 3);
        assert_eq!(child_ids(&nodes[0]), vec![Value::from(100), Value::from(101), Value::from(103)]);
        assert_eq!(child_ids(&nodes[1]), vec![Value::from(102)]);
        assert!(child_ids(&nodes[2]).is_empty());
        assert!(f.join.schema().relationships.contains_key("comments"));
    }

    #[test]
    fn test_parent_push() {
        let f = fixture(None);
        f.join.fetch(FetchRequest::new()).unwrap().count();
        f.issues
            .push(SourceChange::Add(row! { "id" => 2, "owner" => 1 }))
            .unwrap_err();
        f.issues
            .push(SourceChange::Remove(row! { "id" => 2, "owner" => 20 }))
            .unwrap();
        let changes = f.catch.changes.borrow();
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            Change::Remove(node) => assert_eq!(child_ids(node), vec![Value::from(102)]),
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_parent_edit() {
        let f = fixture(None);
        f.issues
            .push(SourceChange::Edit {
                old_row: row! { "id" => 1, "owner" => 10 },
                row: row! { "id" => 1, "owner" => 11 },
            })
            .unwrap();
        let changes = f.catch.changes.borrow();
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            Change::Edit { old_node, node } => {
                assert_eq!(child_ids(old_node).len(), 3);
                assert_eq!(child_ids(node).len(), 3);
                assert_eq!(node.row.get("owner"), &Value::from(11));
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_child_push_wraps_for_parents() {
        let f = fixture(None);
        f.comments
            .push(SourceChange::Add(row! { "id" => 104, "issue" => 3 }))
            .unwrap();
        f.comments
            .push(SourceChange::Add(row! { "id" => 105, "issue" => 9 }))
            .unwrap();
        let changes = f.catch.changes.borrow();
        assert_eq!(
            *changes,
            vec![Change::child(
                row! { "id" => 3, "owner" => 10 },
                "comments",
                Change::Add(Node::new(row! { "id" => 104, "issue" => 3 })),
            )]
        );
    }

    #[test]
    fn test_child_key_edit_splits() {
        let f = fixture(None);
        f.comments
            .push(SourceChange::Edit {
                old_row: row! { "id" => 102, "issue" => 2 },
                row: row! { "id" => 102, "issue" => 3 },
            })
            .unwrap();
        let changes = f.catch.changes.borrow();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].row(), &row! { "id" => 2, "owner" => 20 });
        assert_eq!(changes[1].row(), &row! { "id" => 3, "owner" => 10 });
        match &changes[0] {
            Change::Child { child, .. } => assert_eq!(child.change.kind(), "remove"),
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_shared_join_key_keeps_child_state() {
        let issues = TableSource::new(spec("issue", &["id", "owner"]));
        let users = TableSource::new(spec("user", &["id"]));
        for (id, owner) in [(1, 10), (2, 10)] {
            issues
                .push(SourceChange::Add(row! { "id" => id, "owner" => owner }))
                .unwrap();
        }
        users.push(SourceChange::Add(row! { "id" => 10 })).unwrap();
        let child = Take::new(
            users.connect(Sort::asc(["id"]), None).unwrap(),
            1,
            Some(vec!["id".to_string()]),
        )
        .unwrap();
        let join = Join::new(JoinArgs {
            parent: issues.connect(Sort::asc(["id"]), None).unwrap(),
            child: child.clone(),
            parent_key: vec!["owner".to_string()],
            child_key: vec!["id".to_string()],
            relationship_name: "owner".to_string(),
            hidden: false,
        })
        .unwrap();
        let catch = Rc::new(Catch::default());
        let weak: Weak<Catch> = Rc::downgrade(&catch);
        join.set_output(weak);
        join.fetch(FetchRequest::new()).unwrap().count();
        assert_eq!(join.parents.borrow().get(&vec![Value::from(10)]).map(|s| s.len()), Some(2));

        issues
            .push(SourceChange::Remove(row! { "id" => 1, "owner" => 10 }))
            .unwrap();
        // The other issue still shares the owner, so the child window survives.
        let owners: Vec<Node> = child
            .fetch(FetchRequest::new().with_constraint(Constraint::new("id", 10)))
            .unwrap()
            .collect();
        assert_eq!(owners.len(), 1);

        issues
            .push(SourceChange::Remove(row! { "id" => 2, "owner" => 10 }))
            .unwrap();
        assert!(join.parents.borrow().is_empty());
        let changes = catch.changes.borrow();
        assert_eq!(changes.len(), 2);
        for change in changes.iter() {
            match change {
                Change::Remove(node) => assert_eq!(node.children("owner").len(), 1),
                other => panic!("unexpected change {other:?}"),
            }
        }
    }

    #[test]
    fn test_limited_children() {
        let f = fixture(Some(2));
        let nodes: Vec<Node> = f.join.fetch(FetchRequest::new()).unwrap().collect();
        assert_eq!(child_ids(&nodes[0]), vec![Value::from(100), Value::from(101)]);

        f.comments
            .push(SourceChange::Add(row! { "id" => 99, "issue" => 1 }))
            .unwrap();
        let changes = f.catch.changes.borrow();
        let kinds: Vec<&str> = changes
            .iter()
            .map(|c| match c {
                Change::Child { child, .. } => child.change.kind(),
                other => other.kind(),
            })
            .collect();
        assert_eq!(kinds, vec!["remove", "add"]);
    }

    #[test]
    fn test_rejects_mismatched_keys() {
        let issues = TableSource::new(spec("issue", &["id", "owner"]));
        let comments = TableSource::new(spec("comment", &["id", "issue"]));
        let err = Join::new(JoinArgs {
            parent: issues.connect(Sort::asc(["id"]), None).unwrap(),
            child: comments.connect(Sort::asc(["id"]), None).unwrap(),
            parent_key: vec!["id".to_string()],
            child_key: vec![],
            relationship_name: "comments".to_string(),
            hidden: false,
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
    }
}
