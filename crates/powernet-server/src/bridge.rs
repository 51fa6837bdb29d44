//! Persistence bridge between compute data and the host's record store.
//!
//! Pure compute values know nothing about persistence; the bridge owns the
//! translation plus a per-entity tracker for dirty fields and validity.
//! Saves touch only fields marked dirty, and even then skip any field
//! whose value matches what the record already holds, which keeps both
//! I/O and downstream replication pressure proportional to real change.

use std::collections::HashMap;

use powernet_logic::consumer::IntensityLevel;
use powernet_logic::entity::{ComputeData, RoleState};

use crate::record::{keys, FieldValue, RecordId, RecordStore};

/// Persisted fields subject to dirty tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    NetworkId,
    IsActive,
    Energy,
    EnergyCapacity,
    Fuel,
    FuelCapacity,
    FuelOutputRate,
    IsRunning,
    IsDemanding,
    IntensityLevel,
}

impl Field {
    /// All fields that apply to the given compute data's role, shared
    /// fields first.
    pub fn for_role(data: &ComputeData) -> &'static [Field] {
        match data.role {
            RoleState::Source(_) => &[
                Field::NetworkId,
                Field::IsActive,
                Field::Fuel,
                Field::FuelCapacity,
                Field::FuelOutputRate,
                Field::IsRunning,
            ],
            RoleState::Storage(_) => &[
                Field::NetworkId,
                Field::IsActive,
                Field::Energy,
                Field::EnergyCapacity,
            ],
            RoleState::Consumer(_) => &[
                Field::NetworkId,
                Field::IsActive,
                Field::IsDemanding,
                Field::IntensityLevel,
            ],
            RoleState::Conduit(_) | RoleState::Pylon => &[Field::NetworkId, Field::IsActive],
        }
    }

    /// The stable record key for this field.
    pub fn key(&self) -> &'static str {
        match self {
            Field::NetworkId => keys::NETWORK_ID,
            Field::IsActive => keys::IS_ACTIVE,
            Field::Energy => keys::ENERGY,
            Field::EnergyCapacity => keys::ENERGY_CAPACITY,
            Field::Fuel => keys::FUEL,
            Field::FuelCapacity => keys::FUEL_CAPACITY,
            Field::FuelOutputRate => keys::FUEL_OUTPUT_RATE,
            Field::IsRunning => keys::IS_RUNNING,
            Field::IsDemanding => keys::IS_DEMANDING,
            Field::IntensityLevel => keys::INTENSITY_LEVEL,
        }
    }
}

/// Validity latch for a tracked entity.
///
/// Existence is confirmed lazily; a confirmed record is cached as valid
/// and not re-checked, while any failure latches invalid and every later
/// action short-circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    #[default]
    Unchecked,
    Valid,
    Invalid,
}

/// Per-entity persistence tracker: dirty set, validity latch, and the
/// last value written (or loaded) per field.
#[derive(Debug, Default)]
pub struct PersistTracker {
    dirty: Vec<Field>,
    validity: Validity,
    baseline: HashMap<Field, FieldValue>,
}

impl PersistTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self, field: Field) {
        if !self.dirty.contains(&field) {
            self.dirty.push(field);
        }
    }

    pub fn is_dirty(&self, field: Field) -> bool {
        self.dirty.contains(&field)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_invalid(&self) -> bool {
        self.validity == Validity::Invalid
    }

    pub fn invalidate(&mut self) {
        self.validity = Validity::Invalid;
    }
}

/// Bridge failure surfaced to `with_validity_check`. Never escapes the
/// bridge boundary: callers see invalidity, not errors.
#[derive(Debug)]
pub enum BridgeError {
    RecordMissing(RecordId),
    WrongFieldType { id: RecordId, key: &'static str },
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::RecordMissing(id) => write!(f, "record {} is missing", id),
            BridgeError::WrongFieldType { id, key } => {
                write!(f, "record {} field {} has the wrong type", id, key)
            }
        }
    }
}

impl std::error::Error for BridgeError {}

/// Current persisted representation of one field, pulled from compute
/// data. Energy and fuel are clamped non-negative at every write.
fn field_value(data: &ComputeData, field: Field) -> FieldValue {
    match field {
        Field::NetworkId => FieldValue::Str(data.network_id.clone()),
        Field::IsActive => FieldValue::Bool(data.is_active),
        Field::Energy => {
            FieldValue::Float(data.as_storage().map(|s| s.energy.max(0.0)).unwrap_or(0.0))
        }
        Field::EnergyCapacity => {
            FieldValue::Float(data.as_storage().map(|s| s.energy_capacity).unwrap_or(0.0))
        }
        Field::Fuel => FieldValue::Float(data.as_source().map(|s| s.fuel.max(0.0)).unwrap_or(0.0)),
        Field::FuelCapacity => {
            FieldValue::Float(data.as_source().map(|s| s.fuel_capacity).unwrap_or(0.0))
        }
        Field::FuelOutputRate => {
            FieldValue::Float(data.as_source().map(|s| s.output_rate).unwrap_or(0.0))
        }
        Field::IsRunning => {
            FieldValue::Bool(data.as_source().map(|s| s.is_running).unwrap_or(false))
        }
        Field::IsDemanding => {
            FieldValue::Bool(data.as_consumer().map(|c| c.is_demanding).unwrap_or(false))
        }
        Field::IntensityLevel => FieldValue::Int(
            data.as_consumer()
                .map(|c| c.intensity.as_i64())
                .unwrap_or(0),
        ),
    }
}

/// Apply one persisted value onto compute data. Absent or mistyped values
/// leave the factory default in place.
fn apply_field(data: &mut ComputeData, field: Field, value: &FieldValue) {
    match field {
        Field::NetworkId => {
            if let Some(s) = value.as_str() {
                data.network_id = s.to_string();
            }
        }
        Field::IsActive => {
            if let Some(b) = value.as_bool() {
                data.is_active = b;
            }
        }
        Field::Energy => {
            if let (Some(f), Some(s)) = (value.as_float(), data.as_storage_mut()) {
                s.energy = f.max(0.0);
            }
        }
        Field::EnergyCapacity => {
            if let (Some(f), Some(s)) = (value.as_float(), data.as_storage_mut()) {
                s.energy_capacity = f;
            }
        }
        Field::Fuel => {
            if let (Some(f), Some(s)) = (value.as_float(), data.as_source_mut()) {
                s.fuel = f.max(0.0);
            }
        }
        Field::FuelCapacity => {
            if let (Some(f), Some(s)) = (value.as_float(), data.as_source_mut()) {
                s.fuel_capacity = f;
            }
        }
        Field::FuelOutputRate => {
            if let (Some(f), Some(s)) = (value.as_float(), data.as_source_mut()) {
                s.output_rate = f;
            }
        }
        Field::IsRunning => {
            if let (Some(b), Some(s)) = (value.as_bool(), data.as_source_mut()) {
                s.is_running = b;
            }
        }
        Field::IsDemanding => {
            if let (Some(b), Some(c)) = (value.as_bool(), data.as_consumer_mut()) {
                c.is_demanding = b;
            }
        }
        Field::IntensityLevel => {
            if let (Some(i), Some(c)) = (value.as_int(), data.as_consumer_mut()) {
                c.intensity = IntensityLevel::from_i64(i);
            }
        }
    }
}

/// Load every role field from the record into compute data. Fields absent
/// on the record keep their factory defaults; either way the effective
/// value becomes the save baseline and dirty tracking starts clean.
pub fn load(
    store: &dyn RecordStore,
    id: RecordId,
    data: &mut ComputeData,
    tracker: &mut PersistTracker,
) -> Result<(), BridgeError> {
    if !store.exists(id) {
        return Err(BridgeError::RecordMissing(id));
    }
    for &field in Field::for_role(data) {
        if let Some(value) = store.get(id, field.key()) {
            apply_field(data, field, &value);
        }
        tracker.baseline.insert(field, field_value(data, field));
    }
    tracker.dirty.clear();
    tracker.validity = Validity::Valid;
    Ok(())
}

/// Write the dirty fields whose values actually changed, then clear dirty
/// tracking. Returns how many fields were written.
pub fn save(
    store: &mut dyn RecordStore,
    id: RecordId,
    data: &ComputeData,
    tracker: &mut PersistTracker,
) -> Result<usize, BridgeError> {
    if !store.exists(id) {
        return Err(BridgeError::RecordMissing(id));
    }
    let mut written = 0;
    for &field in &tracker.dirty.clone() {
        let value = field_value(data, field);
        if tracker.baseline.get(&field) == Some(&value) {
            continue; // unchanged since last load/save
        }
        store.set(id, field.key(), value.clone());
        tracker.baseline.insert(field, value);
        written += 1;
    }
    tracker.dirty.clear();
    Ok(written)
}

/// Save under the validity guard: an invalid entity is skipped outright,
/// and a failing save invalidates instead of propagating. Returns the
/// number of fields written, or `None` when nothing ran.
pub fn save_guarded(
    store: &mut dyn RecordStore,
    id: RecordId,
    data: &ComputeData,
    tracker: &mut PersistTracker,
) -> Option<usize> {
    match tracker.validity {
        Validity::Invalid => return None,
        Validity::Valid => {}
        Validity::Unchecked => {
            if store.exists(id) {
                tracker.validity = Validity::Valid;
            } else {
                log::warn!("power entity {} has no backing record, marking invalid", id);
                tracker.validity = Validity::Invalid;
                return None;
            }
        }
    }
    match save(store, id, data, tracker) {
        Ok(written) => Some(written),
        Err(err) => {
            log::warn!("power entity {} save failed ({}), marking invalid", id, err);
            tracker.validity = Validity::Invalid;
            None
        }
    }
}

/// Run `action` under the validity guard.
///
/// An invalid entity short-circuits immediately. Otherwise the backing
/// record's existence is confirmed (cached once it succeeds), the action
/// runs, and any failure is converted into invalidity and logged rather
/// than propagated. Returns `None` whenever the action did not run or did
/// not succeed.
pub fn with_validity_check<T>(
    store: &dyn RecordStore,
    id: RecordId,
    tracker: &mut PersistTracker,
    action: impl FnOnce() -> Result<T, BridgeError>,
) -> Option<T> {
    match tracker.validity {
        Validity::Invalid => return None,
        Validity::Valid => {}
        Validity::Unchecked => {
            if store.exists(id) {
                tracker.validity = Validity::Valid;
            } else {
                log::warn!("power entity {} has no backing record, marking invalid", id);
                tracker.validity = Validity::Invalid;
                return None;
            }
        }
    }
    match action() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("power entity {} action failed ({}), marking invalid", id, err);
            tracker.validity = Validity::Invalid;
            None
        }
    }
}
