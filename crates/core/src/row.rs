//! Row structure for rill.
//!
//! A `Row` is an ordered mapping of column name to `Value`. Columns that are
//! absent read as `Null`.

use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

/// A row of a table or a pipeline result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Sets a column, returning the previous value.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(column.into(), value.into())
    }

    /// Returns the value of a column, `Null` if absent.
    #[inline]
    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&NULL)
    }

    /// Returns true if the column is present (even if null).
    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Returns the number of columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row has no columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Projects the given columns into a tuple of values.
    pub fn values_for<'a>(&self, columns: impl IntoIterator<Item = &'a String>) -> Vec<Value> {
        columns.into_iter().map(|c| self.get(c).clone()).collect()
    }

    /// Returns true if every listed column holds the same value in both rows.
    pub fn equal_on(&self, other: &Row, columns: &[String]) -> bool {
        columns.iter().all(|c| self.get(c) == other.get(c))
    }
}

impl<K, V> FromIterator<(K, V)> for Row
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// Builds a row from `column => value` pairs.
///
/// ```
/// use rill_core::{row, Value};
///
/// let r = row! { "id" => 1, "title" => "hello" };
/// assert_eq!(r.get("title"), &Value::from("hello"));
/// ```
#[macro_export]
macro_rules! row {
    () => { $crate::Row::new() };
    ($($col:expr => $val:expr),+ $(,)?) => {
        $crate::Row::new()$(.with($col, $val))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_get_missing_is_null() {
        let r = Row::new().with("a", 1);
        assert_eq!(r.get("a"), &Value::from(1));
        assert_eq!(r.get("b"), &Value::Null);
        assert!(!r.contains("b"));
    }

    #[test]
    fn test_row_macro_and_iter() {
        let r = row! { "b" => "x", "a" => true };
        let cols: Vec<&str> = r.iter().map(|(c, _)| c).collect();
        assert_eq!(cols, vec!["a", "b"]);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_row_equal_on() {
        let a = row! { "id" => 1, "x" => 2 };
        let b = row! { "id" => 1, "x" => 3 };
        assert!(a.equal_on(&b, &["id".to_string()]));
        assert!(!a.equal_on(&b, &["id".to_string(), "x".to_string()]));
    }

    #[test]
    fn test_row_serialize_flat() {
        let r = row! { "id" => 7, "title" => "t", "done" => Value::Null };
        assert_eq!(
            serde_json::to_string(&r).unwrap(),
            r#"{"done":null,"id":7,"title":"t"}"#
        );
    }
}
