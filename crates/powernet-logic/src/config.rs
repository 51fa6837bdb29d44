//! Tunable constants for the power-network subsystem.
//!
//! All spatial thresholds are expressed in world units and compared as
//! squared distances. Connection ranges are read from this config when an
//! entity is constructed from its prefab kind.

use serde::{Deserialize, Serialize};

use crate::entity::PrefabKind;

/// Configuration for the power-network subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Two entities join the same network when a chain of pairwise
    /// distances at or below this value connects them (default: 16).
    pub join_distance: f32,
    /// Observers within this range of any changed entity receive a
    /// change notice (default: 40).
    pub notify_range: f32,
    /// A rebuilt cluster spanning more than this distance from its BFS
    /// root is logged as a likely data problem (default: 250).
    pub cluster_span_warn: f32,
    /// Connection range for generators (default: 16).
    pub generator_range: f32,
    /// Connection range for batteries (default: 16).
    pub battery_range: f32,
    /// Connection range for machines (default: 16).
    pub machine_range: f32,
    /// Connection range for charge pads (default: 16).
    pub charge_pad_range: f32,
    /// Connection range for pylons, which exist only to relay (default: 24).
    pub pylon_range: f32,
    /// How many polls a bounded registration lookup may spend before it
    /// times out (default: 60).
    pub lookup_attempt_budget: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            join_distance: 16.0,
            notify_range: 40.0,
            cluster_span_warn: 250.0,
            generator_range: 16.0,
            battery_range: 16.0,
            machine_range: 16.0,
            charge_pad_range: 16.0,
            pylon_range: 24.0,
            lookup_attempt_budget: 60,
        }
    }
}

impl PowerConfig {
    /// Squared join threshold, the form every clustering comparison uses.
    pub fn join_distance_sq(&self) -> f32 {
        self.join_distance * self.join_distance
    }

    /// Squared notify range.
    pub fn notify_range_sq(&self) -> f32 {
        self.notify_range * self.notify_range
    }

    /// Connection range for a given prefab kind.
    pub fn connection_range(&self, prefab: PrefabKind) -> f32 {
        match prefab {
            PrefabKind::Generator => self.generator_range,
            PrefabKind::Battery => self.battery_range,
            PrefabKind::Machine => self.machine_range,
            PrefabKind::ChargePad => self.charge_pad_range,
            PrefabKind::Pylon => self.pylon_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PowerConfig::default();
        assert_eq!(config.join_distance, 16.0);
        assert_eq!(config.notify_range, 40.0);
        assert_eq!(config.join_distance_sq(), 256.0);
    }

    #[test]
    fn test_pylon_reaches_further() {
        let config = PowerConfig::default();
        assert!(config.connection_range(PrefabKind::Pylon) > config.connection_range(PrefabKind::Machine));
    }
}
