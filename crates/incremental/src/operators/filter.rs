//! Incremental filter operator.

use crate::change::Change;
use crate::condition::Predicate;
use crate::operator::{FetchRequest, Input, Output, OutputSlot, Stream};
use crate::schema::SourceSchema;
use rill_core::Result;
use std::rc::{Rc, Weak};

/// Passes through the nodes whose row satisfies a predicate.
///
/// Filter is stateless. An edit that moves a row across the predicate is
/// forwarded as the add or remove it amounts to downstream.
pub struct Filter {
    input: Rc<dyn Input>,
    predicate: Predicate,
    output: OutputSlot,
}

impl Filter {
    pub fn new(input: Rc<dyn Input>, predicate: Predicate) -> Rc<Self> {
        let filter = Rc::new(Self {
            input,
            predicate,
            output: OutputSlot::new(),
        });
        let weak: Weak<Filter> = Rc::downgrade(&filter);
        filter.input.set_output(weak);
        filter
    }
}

impl Input for Filter {
    fn schema(&self) -> &SourceSchema {
        self.input.schema()
    }

    fn fetch(&self, req: FetchRequest) -> Result<Stream<'_>> {
        let input = self.input.fetch(req)?;
        Ok(Box::new(input.filter(move |node| (self.predicate)(&node.row))))
    }

    fn cleanup(&self, req: FetchRequest) -> Result<Stream<'_>> {
        let input = self.input.cleanup(req)?;
        Ok(Box::new(input.filter(move |node| (self.predicate)(&node.row))))
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        self.output.set(output);
    }

    fn destroy(&self) {
        self.output.clear();
        self.input.destroy();
    }
}

impl Output for Filter {
    fn push(&self, change: Change) -> Result<()> {
        match change {
            Change::Edit { old_node, node } => {
                match ((self.predicate)(&old_node.row), (self.predicate)(&node.row)) {
                    (true, true) => self.output.push(Change::Edit { old_node, node }),
                    (true, false) => self.output.push(Change::Remove(old_node)),
                    (false, true) => self.output.push(Change::Add(node)),
                    (false, false) => Ok(()),
                }
            }
            other => {
                if (self.predicate)(other.row()) {
                    self.output.push(other)
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SourceChange;
    use crate::condition::{Condition, SimpleOperator};
    use crate::node::Node;
    use crate::source::TableSource;
    use rill_core::{row, Row, Sort, TableBuilder, ValueType};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Catch(RefCell<Vec<Change>>);

    impl Output for Catch {
        fn push(&self, change: Change) -> Result<()> {
            self.0.borrow_mut().push(change);
            Ok(())
        }
    }

    fn setup() -> (TableSource, Rc<Filter>, Rc<Catch>) {
        let spec = TableBuilder::new("t")
            .unwrap()
            .add_column("id", ValueType::Number)
            .unwrap()
            .add_column("n", ValueType::Number)
            .unwrap()
            .add_primary_key(&["id"])
            .unwrap()
            .build()
            .unwrap();
        let source = TableSource::new(spec);
        for (id, n) in [(1, 1), (2, 5), (3, 9)] {
            source.push(SourceChange::Add(row! { "id" => id, "n" => n })).unwrap();
        }
        let input = source.connect(Sort::asc(["id"]), None).unwrap();
        let filter = Filter::new(
            input,
            Condition::simple("n", SimpleOperator::Gt, 3).into_predicate(),
        );
        let catch = Rc::new(Catch::default());
        let weak: Weak<Catch> = Rc::downgrade(&catch);
        filter.set_output(weak);
        (source, filter, catch)
    }

    #[test]
    fn test_filter_fetch() {
        let (_source, filter, _) = setup();
        let rows: Vec<Row> = filter.fetch(FetchRequest::new()).unwrap().map(|n| n.row).collect();
        assert_eq!(rows, vec![row! { "id" => 2, "n" => 5 }, row! { "id" => 3, "n" => 9 }]);
    }

    #[test]
    fn test_filter_push() {
        let (source, _filter, catch) = setup();
        source.push(SourceChange::Add(row! { "id" => 4, "n" => 0 })).unwrap();
        source.push(SourceChange::Add(row! { "id" => 5, "n" => 7 })).unwrap();
        assert_eq!(
            *catch.0.borrow(),
            vec![Change::Add(Node::new(row! { "id" => 5, "n" => 7 }))]
        );
    }

    #[test]
    fn test_filter_edit_crossing_predicate() {
        let (source, _filter, catch) = setup();
        source
            .push(SourceChange::Edit {
                old_row: row! { "id" => 1, "n" => 1 },
                row: row! { "id" => 1, "n" => 4 },
            })
            .unwrap();
        source
            .push(SourceChange::Edit {
                old_row: row! { "id" => 2, "n" => 5 },
                row: row! { "id" => 2, "n" => 2 },
            })
            .unwrap();
        source
            .push(SourceChange::Edit {
                old_row: row! { "id" => 3, "n" => 9 },
                row: row! { "id" => 3, "n" => 8 },
            })
            .unwrap();
        assert_eq!(
            *catch.0.borrow(),
            vec![
                Change::Add(Node::new(row! { "id" => 1, "n" => 4 })),
                Change::Remove(Node::new(row! { "id" => 2, "n" => 5 })),
                Change::edit(row! { "id" => 3, "n" => 9 }, row! { "id" => 3, "n" => 8 }),
            ]
        );
    }
}
