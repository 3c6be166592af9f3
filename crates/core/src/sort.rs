//! Orderings over rows.
//!
//! A `Sort` is the list of `(column, Order)` pairs a connection reads in. It
//! doubles as the row comparator and must end in (or otherwise contain) every
//! primary-key column so that no two distinct rows compare equal.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::schema::PrimaryKey;
use core::cmp::Ordering;

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Order {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

impl Order {
    /// Applies the direction to an ascending comparison result.
    #[inline]
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Order::Asc => ord,
            Order::Desc => ord.reverse(),
        }
    }
}

/// One component of an ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderPart {
    pub column: String,
    pub order: Order,
}

/// An ordering: ordered list of (column, direction).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sort {
    parts: Vec<OrderPart>,
}

impl Sort {
    /// Creates an ordering from `(column, order)` pairs.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = (S, Order)>,
        S: Into<String>,
    {
        Self {
            parts: parts
                .into_iter()
                .map(|(column, order)| OrderPart {
                    column: column.into(),
                    order,
                })
                .collect(),
        }
    }

    /// Ascending ordering over the given columns.
    pub fn asc<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(columns.into_iter().map(|c| (c, Order::Asc)))
    }

    #[inline]
    pub fn parts(&self) -> &[OrderPart] {
        &self.parts
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Appends a part, returning the extended ordering.
    pub fn then(mut self, column: impl Into<String>, order: Order) -> Self {
        self.parts.push(OrderPart {
            column: column.into(),
            order,
        });
        self
    }

    /// Appends every part of `other` whose column is not yet present.
    pub fn extend_with(&mut self, other: &Sort) {
        for part in &other.parts {
            if !self.contains_column(&part.column) {
                self.parts.push(part.clone());
            }
        }
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.parts.iter().any(|p| p.column == column)
    }

    /// Compares two rows under this ordering.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for part in &self.parts {
            let ord = a.get(&part.column).cmp(b.get(&part.column));
            if ord != Ordering::Equal {
                return part.order.apply(ord);
            }
        }
        Ordering::Equal
    }

    /// Fails if any primary-key column is missing from the ordering.
    pub fn ensure_includes_primary_key(&self, primary_key: &PrimaryKey) -> Result<()> {
        for column in primary_key.columns() {
            if !self.contains_column(column) {
                return Err(Error::invalid_ordering(column.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{row, Value};

    #[test]
    fn test_order_apply() {
        assert_eq!(Order::Asc.apply(Ordering::Less), Ordering::Less);
        assert_eq!(Order::Desc.apply(Ordering::Less), Ordering::Greater);
    }

    #[test]
    fn test_compare_rows_multi_part() {
        let sort = Sort::new([("a", Order::Desc), ("id", Order::Asc)]);
        let r1 = row! { "a" => 2, "id" => 1 };
        let r2 = row! { "a" => 1, "id" => 0 };
        let r3 = row! { "a" => 2, "id" => 5 };
        assert_eq!(sort.compare_rows(&r1, &r2), Ordering::Less);
        assert_eq!(sort.compare_rows(&r1, &r3), Ordering::Less);
        assert_eq!(sort.compare_rows(&r1, &r1), Ordering::Equal);
    }

    #[test]
    fn test_null_sorts_first() {
        let sort = Sort::asc(["a"]);
        let r1 = row! { "a" => Value::Null };
        let r2 = row! { "a" => 0 };
        assert_eq!(sort.compare_rows(&r1, &r2), Ordering::Less);
        assert_eq!(sort.compare_rows(&Row::new(), &r1), Ordering::Equal);
    }

    #[test]
    fn test_ensure_includes_primary_key() {
        let pk = PrimaryKey::new(["id"]).unwrap();
        assert!(Sort::asc(["a", "id"]).ensure_includes_primary_key(&pk).is_ok());
        let err = Sort::asc(["a"]).ensure_includes_primary_key(&pk).unwrap_err();
        assert!(matches!(err, Error::InvalidOrdering { column } if column == "id"));
    }

    #[test]
    fn test_extend_with_skips_duplicates() {
        let mut sort = Sort::asc(["a"]);
        sort.extend_with(&Sort::new([("a", Order::Desc), ("id", Order::Asc)]));
        assert_eq!(sort, Sort::asc(["a", "id"]));
    }
}
