//! Row conditions and the predicates compiled from them.

use core::cmp::Ordering;
use rill_core::{values_equal, Row, Value};
use std::rc::Rc;

/// A compiled row predicate.
pub type Predicate = Rc<dyn Fn(&Row) -> bool>;

/// Comparison operator of a simple condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimpleOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Null-safe equality.
    Is,
    /// Null-safe inequality.
    IsNot,
}

/// A filter condition over rows.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Simple {
        column: String,
        op: SimpleOperator,
        value: Value,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn simple(column: impl Into<String>, op: SimpleOperator, value: impl Into<Value>) -> Self {
        Condition::Simple {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(column, SimpleOperator::Eq, value)
    }

    /// Evaluates the condition against a row.
    ///
    /// Comparisons other than `Is`/`IsNot` are false when either side is null.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Simple { column, op, value } => {
                let lhs = row.get(column);
                match op {
                    SimpleOperator::Eq => values_equal(lhs, value),
                    SimpleOperator::Ne => !lhs.is_null() && !value.is_null() && lhs != value,
                    SimpleOperator::Is => lhs == value,
                    SimpleOperator::IsNot => lhs != value,
                    SimpleOperator::Lt => compare(lhs, value) == Some(Ordering::Less),
                    SimpleOperator::Le => {
                        matches!(compare(lhs, value), Some(Ordering::Less | Ordering::Equal))
                    }
                    SimpleOperator::Gt => compare(lhs, value) == Some(Ordering::Greater),
                    SimpleOperator::Ge => {
                        matches!(compare(lhs, value), Some(Ordering::Greater | Ordering::Equal))
                    }
                }
            }
            Condition::And(conditions) => conditions.iter().all(|c| c.matches(row)),
            Condition::Or(conditions) => conditions.iter().any(|c| c.matches(row)),
        }
    }

    /// Compiles the condition into a shareable predicate.
    pub fn into_predicate(self) -> Predicate {
        Rc::new(move |row: &Row| self.matches(row))
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        None
    } else {
        Some(a.cmp(b))
    }
}
