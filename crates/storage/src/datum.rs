//! Stored cell values.
//!
//! The replica keeps integers at full 64-bit width. Engine rows hold numbers
//! as doubles, so converting a stored row into a `Row` fails when an integer
//! cannot be represented exactly.

use core::cmp::Ordering;
use rill_core::{Error, Result, Row, Value, MAX_SAFE_INTEGER};
use std::collections::BTreeMap;

/// A value as stored by the replica.
#[derive(Clone, Debug)]
pub enum Datum {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Datum {
    /// Converts into an engine value, checking the safe integer range.
    pub fn to_value(&self, column: &str) -> Result<Value> {
        Ok(match self {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Integer(i) => {
                if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                    return Err(Error::value_out_of_range(column, i));
                }
                Value::Number(*i as f64)
            }
            Datum::Real(f) => Value::Number(*f),
            Datum::Text(s) => Value::String(s.clone()),
        })
    }

    /// Converts an engine value; integral numbers are stored as integers.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Number(f) => match value.as_i64() {
                Some(i) => Datum::Integer(i),
                None => Datum::Real(*f),
            },
            Value::String(s) => Datum::Text(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Integer(_) | Datum::Real(_) => 2,
            Datum::Text(_) => 3,
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Integer(a), Datum::Integer(b)) => a.cmp(b),
            (Datum::Integer(a), Datum::Real(b)) => cmp_integer_real(*a, *b),
            (Datum::Real(a), Datum::Integer(b)) => cmp_integer_real(*b, *a).reverse(),
            (Datum::Real(a), Datum::Real(b)) => cmp_reals(*a, *b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Orders reals with `-0.0 == 0.0`; NaNs sort by sign past every number.
fn cmp_reals(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

/// Compares an integer and a real exactly, without rounding the integer.
fn cmp_integer_real(i: i64, f: f64) -> Ordering {
    // 2^63; every finite real in [-2^63, 2^63) truncates to a valid i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= LIMIT {
        return Ordering::Less;
    }
    if f < -LIMIT {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    i.cmp(&(whole as i64)).then_with(|| 0f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal))
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Integer(v as i64)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Integer(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Real(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.into())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Text(v)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Datum::Null)
    }
}

/// Primary-key tuple of a stored row.
pub type StoredKey = Vec<Datum>;

/// A row as stored by the replica.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredRow {
    cells: BTreeMap<String, Datum>,
}

impl StoredRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, datum: impl Into<Datum>) -> Self {
        self.cells.insert(column.into(), datum.into());
        self
    }

    /// Returns a cell, `Null` if absent.
    pub fn get(&self, column: &str) -> &Datum {
        static NULL: Datum = Datum::Null;
        self.cells.get(column).unwrap_or(&NULL)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    /// Extracts the key tuple for the given key columns.
    pub fn key(&self, key_columns: &[String]) -> StoredKey {
        key_columns.iter().map(|c| self.get(c).clone()).collect()
    }

    /// Converts into an engine row.
    pub fn to_row(&self) -> Result<Row> {
        let mut row = Row::new();
        for (column, datum) in &self.cells {
            row.set(column.clone(), datum.to_value(column)?);
        }
        Ok(row)
    }

    /// Converts from an engine row.
    pub fn from_row(row: &Row) -> Self {
        Self {
            cells: row
                .iter()
                .map(|(c, v)| (c.to_string(), Datum::from_value(v)))
                .collect(),
        }
    }
}

/// Converts a key tuple into a row holding only the key columns.
pub(crate) fn key_to_row(key_columns: &[String], key: &[Datum]) -> Result<Row> {
    let mut row = Row::new();
    for (column, datum) in key_columns.iter().zip(key) {
        row.set(column.clone(), datum.to_value(column)?);
    }
    Ok(row)
}
