//! Compute data for power-network entities.
//!
//! Each entity is a pure value: shared fields plus a role payload expressed
//! as a sum type. Construction goes through the prefab factory so that
//! connection ranges and role defaults always come from configuration, and
//! so that the numeric prefab discriminant used on the wire and in records
//! maps to exactly one constructor.

use serde::{Deserialize, Serialize};

use crate::conduit::{ConduitMode, ConduitState};
use crate::config::PowerConfig;
use crate::consumer::ConsumerState;
use crate::source::SourceState;
use crate::storage::StorageState;

/// Concrete device kinds the subsystem knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PrefabKind {
    Generator = 0,
    Battery = 1,
    Machine = 2,
    ChargePad = 3,
    Pylon = 4,
}

impl PrefabKind {
    /// Map a persisted/wire discriminant to a prefab kind.
    pub fn from_discriminant(value: u16) -> Option<Self> {
        match value {
            0 => Some(PrefabKind::Generator),
            1 => Some(PrefabKind::Battery),
            2 => Some(PrefabKind::Machine),
            3 => Some(PrefabKind::ChargePad),
            4 => Some(PrefabKind::Pylon),
            _ => None,
        }
    }

    /// The role this prefab plays in a network.
    pub fn role(&self) -> EntityRole {
        match self {
            PrefabKind::Generator => EntityRole::Source,
            PrefabKind::Battery => EntityRole::Storage,
            PrefabKind::Machine => EntityRole::Consumer,
            PrefabKind::ChargePad => EntityRole::Conduit,
            PrefabKind::Pylon => EntityRole::Pylon,
        }
    }
}

/// Network role of an entity, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRole {
    Source,
    Storage,
    Consumer,
    Conduit,
    Pylon,
}

/// Role payload for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoleState {
    Source(SourceState),
    Storage(StorageState),
    Consumer(ConsumerState),
    Conduit(ConduitState),
    Pylon,
}

impl RoleState {
    pub fn role(&self) -> EntityRole {
        match self {
            RoleState::Source(_) => EntityRole::Source,
            RoleState::Storage(_) => EntityRole::Storage,
            RoleState::Consumer(_) => EntityRole::Consumer,
            RoleState::Conduit(_) => EntityRole::Conduit,
            RoleState::Pylon => EntityRole::Pylon,
        }
    }
}

/// In-memory compute state for one power-network entity.
///
/// The persisted record is authoritative for `network_id`; the copy here
/// is a read accelerator maintained by the cluster manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeData {
    pub network_id: String,
    pub is_active: bool,
    pub connection_range: f32,
    pub prefab: PrefabKind,
    pub role: RoleState,
}

impl ComputeData {
    /// Factory: build compute data for a prefab kind, pulling connection
    /// range and role defaults from configuration.
    pub fn from_prefab(prefab: PrefabKind, config: &PowerConfig) -> Self {
        let role = match prefab {
            PrefabKind::Generator => RoleState::Source(SourceState::new(100.0, 5.0)),
            PrefabKind::Battery => RoleState::Storage(StorageState::new(100.0)),
            PrefabKind::Machine => RoleState::Consumer(ConsumerState::new(3.0)),
            PrefabKind::ChargePad => RoleState::Conduit(ConduitState::new(ConduitMode::Drain)),
            PrefabKind::Pylon => RoleState::Pylon,
        };
        Self {
            network_id: String::new(),
            is_active: true,
            connection_range: config.connection_range(prefab),
            prefab,
            role,
        }
    }

    pub fn role(&self) -> EntityRole {
        self.role.role()
    }

    pub fn as_source(&self) -> Option<&SourceState> {
        match &self.role {
            RoleState::Source(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_source_mut(&mut self) -> Option<&mut SourceState> {
        match &mut self.role {
            RoleState::Source(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_storage(&self) -> Option<&StorageState> {
        match &self.role {
            RoleState::Storage(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_storage_mut(&mut self) -> Option<&mut StorageState> {
        match &mut self.role {
            RoleState::Storage(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&ConsumerState> {
        match &self.role {
            RoleState::Consumer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_consumer_mut(&mut self) -> Option<&mut ConsumerState> {
        match &mut self.role {
            RoleState::Consumer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_conduit(&self) -> Option<&ConduitState> {
        match &self.role {
            RoleState::Conduit(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_conduit_mut(&mut self) -> Option<&mut ConduitState> {
        match &mut self.role {
            RoleState::Conduit(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminant_roundtrip() {
        for kind in [
            PrefabKind::Generator,
            PrefabKind::Battery,
            PrefabKind::Machine,
            PrefabKind::ChargePad,
            PrefabKind::Pylon,
        ] {
            assert_eq!(PrefabKind::from_discriminant(kind as u16), Some(kind));
        }
        assert_eq!(PrefabKind::from_discriminant(999), None);
    }

    #[test]
    fn test_factory_assigns_role_and_range() {
        let config = PowerConfig::default();
        let data = ComputeData::from_prefab(PrefabKind::Battery, &config);
        assert_eq!(data.role(), EntityRole::Storage);
        assert_eq!(data.connection_range, config.battery_range);
        assert!(data.is_active);
        assert!(data.network_id.is_empty());

        let pylon = ComputeData::from_prefab(PrefabKind::Pylon, &config);
        assert_eq!(pylon.role(), EntityRole::Pylon);
        assert_eq!(pylon.connection_range, config.pylon_range);
    }

    #[test]
    fn test_role_accessors() {
        let config = PowerConfig::default();
        let mut data = ComputeData::from_prefab(PrefabKind::Generator, &config);
        assert!(data.as_source().is_some());
        assert!(data.as_storage().is_none());
        if let Some(source) = data.as_source_mut() {
            source.fuel = 10.0;
        }
        assert_eq!(data.as_source().map(|s| s.fuel), Some(10.0));
    }
}
