//! Object identity.
//!
//! An [`ObjectId`] names one row of one entity. Permanent ids carry the
//! primary key column values; temporary ids stand in for rows that have not
//! been inserted yet and are unique within the process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

static NEXT_TEMPORARY_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of a persistent object: entity name plus key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    entity: String,
    key: BTreeMap<String, Value>,
    temporary: Option<u64>,
}

impl ObjectId {
    /// Build a permanent id from key column/value pairs.
    pub fn new<K, V, I>(entity: impl Into<String>, key: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            entity: entity.into(),
            key: key
                .into_iter()
                .map(|(k, v)| (k.into(), v.into().to_key()))
                .collect(),
            temporary: None,
        }
    }

    /// Permanent id for a single-column primary key.
    pub fn single(entity: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(entity, [(column.into(), value.into())])
    }

    /// Fresh temporary id, unique for the lifetime of the process.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: BTreeMap::new(),
            temporary: Some(NEXT_TEMPORARY_KEY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary.is_some()
    }

    /// Key columns and values; empty for temporary ids.
    pub fn key_values(&self) -> &BTreeMap<String, Value> {
        &self.key
    }

    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.key.get(column)
    }

    /// Same key under another entity name (used when a row read through a
    /// parent entity turns out to belong to a subentity).
    #[must_use]
    pub fn with_entity(&self, entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: self.key.clone(),
            temporary: self.temporary,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjectId:{}", self.entity)?;
        if let Some(tmp) = self.temporary {
            write!(f, ", TEMP:{}", tmp)?;
        }
        for (column, value) in &self.key {
            match value {
                Value::Text(s) => write!(f, ", {}={}", column, s)?,
                other => write!(f, ", {}={}", column, other)?,
            }
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_equal_ids_match_entity_and_key() {
        let a = ObjectId::single("Artist", "ARTIST_ID", 5);
        let b = ObjectId::single("Artist", "ARTIST_ID", 5_i64);
        let c = ObjectId::single("Painting", "ARTIST_ID", 5);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut map = HashMap::new();
        map.insert(a.clone(), 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_compound_key_order_does_not_matter() {
        let a = ObjectId::new("Link", [("A_ID", 1), ("B_ID", 2)]);
        let b = ObjectId::new("Link", [("B_ID", 2), ("A_ID", 1)]);
        assert_eq!(a, b);
        assert_eq!(a.key_value("B_ID"), Some(&Value::BigInt(2)));
    }

    #[test]
    fn test_temporary_ids_are_unique() {
        let a = ObjectId::temporary("Artist");
        let b = ObjectId::temporary("Artist");
        assert!(a.is_temporary());
        assert_ne!(a, b);
        assert!(a.key_values().is_empty());
    }

    #[test]
    fn test_display() {
        let id = ObjectId::single("Artist", "ARTIST_ID", 1);
        assert_eq!(id.to_string(), "<ObjectId:Artist, ARTIST_ID=1>");
    }
}
