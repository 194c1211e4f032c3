//! Result rows and order-independent row multisets.
//!
//! Two rows are equal when they carry the same columns with the same values,
//! regardless of the order the columns were inserted in. Equality, hashing
//! and ordering all go through [`Row::canonical_key`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Serialization with sorted keys and integral floats written as
    /// integers, so `{"b":1,"a":2.0}` and `{"a":2,"b":1}` share one key.
    pub fn canonical_key(&self) -> String {
        let mut out = String::new();
        write_canonical(&mut out, &Value::Object(self.0.clone()));
        out
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_key() == other.canonical_key()
    }
}

impl Eq for Row {}

impl Hash for Row {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_key().hash(state);
    }
}

impl PartialOrd for Row {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Row {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_key().cmp(&other.canonical_key())
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => out.push_str(&value.to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                let _ = write!(out, "{}", f as i64);
            }
            _ => out.push_str(&n.to_string()),
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEntry {
    pub row: Row,
    pub count: usize,
}

/// Multiset of rows keyed by canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSet {
    entries: BTreeMap<String, RowEntry>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut set = Self::new();
        for row in rows {
            set.insert(row.clone());
        }
        set
    }

    pub fn insert(&mut self, row: Row) {
        self.insert_n(row, 1);
    }

    pub fn insert_n(&mut self, row: Row, count: usize) {
        if count == 0 {
            return;
        }
        match self.entries.entry(row.canonical_key()) {
            Entry::Occupied(mut e) => e.get_mut().count += count,
            Entry::Vacant(e) => {
                e.insert(RowEntry { row, count });
            }
        }
    }

    pub fn contains(&self, row: &Row) -> bool {
        self.entries.contains_key(&row.canonical_key())
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn multiplicity(&self, row: &Row) -> usize {
        self.entries
            .get(&row.canonical_key())
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Number of distinct rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total(&self) -> usize {
        self.entries.values().map(|e| e.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.entries.values().map(|e| &e.row)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &RowEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn equality_ignores_column_order() {
        let a = Row::from_pairs([("id", json!(1)), ("name", json!("x"))]);
        let b = Row::from_pairs([("name", json!("x")), ("id", json!(1))]);
        assert_eq!(a, b);
        assert_eq!(a.canonical_key(), r#"{"id":1,"name":"x"}"#);
    }

    #[test]
    fn integral_float_equals_integer() {
        assert_eq!(row(json!({"n": 2.0})), row(json!({"n": 2})));
        assert_ne!(row(json!({"n": 2.5})), row(json!({"n": 2})));
    }

    #[test]
    fn different_columns_are_not_equal() {
        assert_ne!(row(json!({"id": 1})), row(json!({"id": 1, "x": null})));
        assert_ne!(row(json!({"id": "1"})), row(json!({"id": 1})));
    }

    #[test]
    fn row_set_counts_duplicates() {
        let rows = vec![
            row(json!({"id": 1})),
            row(json!({"id": 2})),
            row(json!({"id": 1})),
        ];
        let set = RowSet::from_rows(&rows);
        assert_eq!(set.len(), 2);
        assert_eq!(set.total(), 3);
        assert_eq!(set.multiplicity(&row(json!({"id": 1}))), 2);
        assert!(!set.contains(&row(json!({"id": 3}))));
    }

    #[test]
    fn row_set_is_order_independent() {
        let forward = vec![row(json!({"id": 1})), row(json!({"id": 2}))];
        let backward: Vec<Row> = forward.iter().rev().cloned().collect();
        assert_eq!(RowSet::from_rows(&forward), RowSet::from_rows(&backward));
    }
}
