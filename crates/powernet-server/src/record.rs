//! Interface boundary to the host's persisted record store.
//!
//! The host world owns the records; this subsystem only reads and writes
//! typed field values under stable string keys. Key names are load-bearing
//! for compatibility with existing saves and must not change.

use std::collections::HashMap;

use powernet_logic::geometry::Vec3;
use serde::{Deserialize, Serialize};

/// Identity of a persisted record.
pub type RecordId = u64;

/// Stable field keys for power-system state on a record.
pub mod keys {
    pub const NETWORK_ID: &str = "PowerSystem_NetworkId";
    pub const IS_ACTIVE: &str = "PowerSystem_IsActive";
    pub const ENERGY: &str = "PowerSystem_Energy";
    pub const ENERGY_CAPACITY: &str = "PowerSystem_EnergyCapacity";
    pub const FUEL: &str = "PowerSystem_Fuel";
    pub const FUEL_CAPACITY: &str = "PowerSystem_StoredFuelCapacity";
    pub const FUEL_OUTPUT_RATE: &str = "PowerSystem_FuelOutputRate";
    pub const IS_RUNNING: &str = "PowerSystem_IsRunning";
    pub const IS_DEMANDING: &str = "PowerSystem_IsDemanding";
    pub const INTENSITY_LEVEL: &str = "PowerSystem_Intensity_Level";
}

/// A typed field value on a persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Str(String),
    Bool(bool),
    Float(f32),
    Int(i64),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// What the subsystem needs from the host's record store.
///
/// `position` reflects where the backing entity currently sits in the
/// world; clustering and replication scoping are driven by it.
pub trait RecordStore {
    /// Whether a record still exists and is usable.
    fn exists(&self, id: RecordId) -> bool;

    /// Read one field. `None` when the record or field is absent.
    fn get(&self, id: RecordId, key: &str) -> Option<FieldValue>;

    /// Write one field. A write to a missing record is ignored by the
    /// in-memory store; host implementations may log.
    fn set(&mut self, id: RecordId, key: &str, value: FieldValue);

    /// World position of the record's entity.
    fn position(&self, id: RecordId) -> Option<Vec3>;
}

/// In-memory record store used by tests and the simtest harness.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<RecordId, MemoryRecord>,
}

#[derive(Debug, Default)]
struct MemoryRecord {
    fields: HashMap<String, FieldValue>,
    position: Vec3,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record at a position. Overwrites any existing record.
    pub fn insert(&mut self, id: RecordId, position: Vec3) {
        self.records.insert(
            id,
            MemoryRecord {
                fields: HashMap::new(),
                position,
            },
        );
    }

    /// Remove a record entirely (the host destroyed the entity).
    pub fn remove(&mut self, id: RecordId) {
        self.records.remove(&id);
    }

    pub fn move_to(&mut self, id: RecordId, position: Vec3) {
        if let Some(record) = self.records.get_mut(&id) {
            record.position = position;
        }
    }

    /// Number of fields present on a record. Used by dirty-write tests.
    pub fn field_count(&self, id: RecordId) -> usize {
        self.records.get(&id).map(|r| r.fields.len()).unwrap_or(0)
    }
}

impl RecordStore for MemoryStore {
    fn exists(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    fn get(&self, id: RecordId, key: &str) -> Option<FieldValue> {
        self.records.get(&id)?.fields.get(key).cloned()
    }

    fn set(&mut self, id: RecordId, key: &str, value: FieldValue) {
        if let Some(record) = self.records.get_mut(&id) {
            record.fields.insert(key.to_string(), value);
        }
    }

    fn position(&self, id: RecordId) -> Option<Vec3> {
        self.records.get(&id).map(|r| r.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        store.insert(1, Vec3::new(1.0, 2.0, 3.0));
        store.set(1, keys::ENERGY, FieldValue::Float(42.0));

        assert!(store.exists(1));
        assert_eq!(store.get(1, keys::ENERGY).and_then(|v| v.as_float()), Some(42.0));
        assert_eq!(store.position(1), Some(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_missing_record_reads_none_and_ignores_writes() {
        let mut store = MemoryStore::new();
        store.set(9, keys::ENERGY, FieldValue::Float(1.0));
        assert!(!store.exists(9));
        assert_eq!(store.get(9, keys::ENERGY), None);
        assert_eq!(store.position(9), None);
    }
}
