//! Flat row snapshots.
//!
//! A [`DataRow`] is one row's column values as last read from or written to
//! the database, keyed by column name. Rows are versioned: every row built
//! gets a fresh process-wide version, and a row produced by a commit records
//! the version it replaces so caches can detect concurrent updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;
use crate::value::Value;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Separator between a relationship path and a column name in joined rows,
/// e.g. `paintings.PAINTING_ID`.
pub const PATH_SEPARATOR: char = '.';

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Column values of a single row plus version bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRow {
    values: BTreeMap<String, Value>,
    version: u64,
    replaces_version: Option<u64>,
}

impl DataRow {
    /// Create an empty row with a fresh version.
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            version: next_version(),
            replaces_version: None,
        }
    }

    /// Build a row from column/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.values.insert(k.into(), v.into());
        }
        row
    }

    /// Builder-style column setter.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replaces_version(&self) -> Option<u64> {
        self.replaces_version
    }

    pub fn set_replaces_version(&mut self, version: Option<u64>) {
        self.replaces_version = version;
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Get a column converted to `T`.
    ///
    /// A missing column converts like NULL, so `Option<T>` targets accept it.
    pub fn get_as<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.values.get(column).unwrap_or(&Value::Null);
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(column.to_string());
                Error::Type(te)
            }
            other => other,
        })
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Values of `columns`, or `None` if any of them is missing or NULL.
    pub fn key_for<'a, I>(&self, columns: I) -> Option<BTreeMap<String, Value>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut key = BTreeMap::new();
        for column in columns {
            match self.values.get(column) {
                Some(v) if !v.is_null() => {
                    key.insert(column.to_string(), v.to_key());
                }
                _ => return None,
            }
        }
        Some(key)
    }

    /// Columns whose value in `newer` differs from this row, with the new
    /// value. Columns dropped in `newer` are reported as NULL.
    pub fn diff(&self, newer: &DataRow) -> BTreeMap<String, Value> {
        let mut changed = BTreeMap::new();
        for (column, value) in &newer.values {
            if self.values.get(column) != Some(value) {
                changed.insert(column.clone(), value.clone());
            }
        }
        for column in self.values.keys() {
            if !newer.values.contains_key(column) {
                changed.insert(column.clone(), Value::Null);
            }
        }
        changed
    }

    /// Copy of this row with `changes` applied, recorded as the successor of
    /// this row's version.
    #[must_use]
    pub fn apply_diff(&self, changes: &BTreeMap<String, Value>) -> DataRow {
        let mut values = self.values.clone();
        for (column, value) in changes {
            values.insert(column.clone(), value.clone());
        }
        DataRow {
            values,
            version: next_version(),
            replaces_version: Some(self.version),
        }
    }

    /// Columns that carry no relationship path prefix.
    #[must_use]
    pub fn root_columns(&self) -> DataRow {
        self.filter_map_columns(|c| (!c.contains(PATH_SEPARATOR)).then(|| c.to_string()))
    }

    /// Columns under `prefix` (e.g. `"paintings."`), with the prefix removed.
    /// Nested paths below the prefix are kept with their remaining prefix.
    #[must_use]
    pub fn prefixed_columns(&self, prefix: &str) -> DataRow {
        self.filter_map_columns(|c| c.strip_prefix(prefix).map(str::to_string))
    }

    fn filter_map_columns(&self, f: impl Fn(&str) -> Option<String>) -> DataRow {
        let values = self
            .values
            .iter()
            .filter_map(|(k, v)| f(k).map(|name| (name, v.clone())))
            .collect();
        DataRow {
            values,
            version: self.version,
            replaces_version: self.replaces_version,
        }
    }
}

impl Default for DataRow {
    fn default() -> Self {
        Self::new()
    }
}

/// Rows compare by content; versions are bookkeeping.
impl PartialEq for DataRow {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

/// Trait for converting from a [`Value`] to a Rust type.
pub trait FromValue: Sized {
    /// Convert from a Value, returning an error if the conversion fails.
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| value.type_error("BOOLEAN", None))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| value.type_error("BIGINT", None))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = value
            .as_i64()
            .ok_or_else(|| value.type_error("INTEGER", None))?;
        i32::try_from(wide).map_err(|_| value.type_error("INTEGER in i32 range", None))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| value.type_error("DOUBLE", None))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| value.type_error("TEXT", None))
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| value.type_error("BLOB", None))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
