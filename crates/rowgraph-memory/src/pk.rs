//! Sequential primary-key generation.

use std::collections::HashMap;

use parking_lot::Mutex;
use rowgraph_core::{EntityInfo, PkGenerator, Result, Value};

/// First value handed out per column unless configured otherwise.
pub const DEFAULT_START: i64 = 200;

/// Hands out increasing integers per `TABLE.COLUMN`.
#[derive(Debug)]
pub struct SequencePkGenerator {
    start: i64,
    next: Mutex<HashMap<String, i64>>,
}

impl SequencePkGenerator {
    pub fn new() -> Self {
        Self::starting_at(DEFAULT_START)
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            start,
            next: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SequencePkGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PkGenerator for SequencePkGenerator {
    fn generate(&self, entity: &EntityInfo, column: &str) -> Result<Value> {
        let mut next = self.next.lock();
        let slot = next
            .entry(format!("{}.{}", entity.table, column))
            .or_insert(self.start);
        let value = *slot;
        *slot += 1;
        Ok(Value::BigInt(value))
    }
}
