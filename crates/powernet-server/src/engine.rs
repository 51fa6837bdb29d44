//! The authoritative simulation driver.
//!
//! [`PowerSystem`] owns the registry, cluster manager, and replicator, and
//! runs one synchronous settlement pass per network per tick from the
//! host's update loop. Within a tick the order is fixed: rebuild (if
//! scheduled), then per network: resolve (discharge peek before source
//! offer), commit, persist, notify. A network whose view cannot be built
//! is skipped for the tick; there is no partial pass.

use powernet_logic::config::PowerConfig;
use powernet_logic::entity::{ComputeData, PrefabKind, RoleState};
use powernet_logic::resolve::{resolve, Settlement};

use crate::bridge::{self, Field};
use crate::cluster::ClusterManager;
use crate::record::{RecordId, RecordStore};
use crate::registry::{PendingLookup, Registry};
use crate::replication::{ObserverId, Replicator, Transport};

/// What one tick did, for the host and for tests.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Networks that ran a settlement pass.
    pub networks: usize,
    /// Entities whose persisted values changed this tick.
    pub changed: Vec<RecordId>,
    /// Observers that received a change notice.
    pub notified: Vec<ObserverId>,
    /// Energy granted per consumer this tick, for hosts that surface a
    /// powered/unpowered state.
    pub consumer_grants: Vec<(RecordId, f32)>,
}

/// The power-network subsystem, owned by the host and driven by three
/// calls: record loaded, record removed, tick.
#[derive(Debug)]
pub struct PowerSystem {
    pub registry: Registry,
    pub clusters: ClusterManager,
    pub replicator: Replicator,
    config: PowerConfig,
}

impl PowerSystem {
    pub fn new(config: PowerConfig) -> Self {
        Self {
            registry: Registry::new(),
            clusters: ClusterManager::new(config.clone()),
            replicator: Replicator::new(config.notify_range),
            config,
        }
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// The host observed a power-prefab record finishing its load. Builds
    /// compute data from the prefab factory, loads persisted fields over
    /// the defaults, and registers. Returns false when the record is
    /// already registered or its backing row is gone.
    pub fn observe_record_loaded(
        &mut self,
        store: &dyn RecordStore,
        id: RecordId,
        prefab: PrefabKind,
    ) -> bool {
        let data = ComputeData::from_prefab(prefab, &self.config);
        if !self.registry.register(id, data) {
            return false;
        }
        let Some(entry) = self.registry.get_mut(id) else {
            return false;
        };
        if let Err(err) = bridge::load(store, id, &mut entry.data, &mut entry.persist) {
            log::warn!("load of power entity {} failed ({}), dropping it", id, err);
            self.registry.unregister(id);
            return false;
        }
        true
    }

    /// The host reset or removed a record. Unregisters and schedules a
    /// rebuild either way.
    pub fn observe_record_removed(&mut self, id: RecordId) {
        self.registry.unregister(id);
    }

    /// Bounded-retry lookup for callers waiting on a registration, using
    /// the configured attempt budget.
    pub fn pending_lookup(&self, id: RecordId) -> PendingLookup {
        PendingLookup::new(id, self.config.lookup_attempt_budget)
    }

    /// Run one simulation tick of duration `dt` over every network.
    pub fn tick(
        &mut self,
        store: &mut dyn RecordStore,
        transport: &mut dyn Transport,
        dt: f32,
    ) -> TickReport {
        let mut report = TickReport::default();

        self.clusters.maybe_rebuild(&mut self.registry, store);

        for network_id in self.clusters.network_ids(&self.registry) {
            let view = self.clusters.view(&self.registry, &network_id);
            if view.is_empty() {
                continue;
            }
            let settlement = resolve(dt, &view);
            report.networks += 1;
            report
                .consumer_grants
                .extend(settlement.consumer_grants.iter().copied());

            // Commit, then persist, then notify, in that order.
            let changed = self.apply_settlement(&settlement);
            for &id in &changed {
                if let Some(entry) = self.registry.get_mut(id) {
                    bridge::save_guarded(store, id, &entry.data, &mut entry.persist);
                }
            }
            let notified =
                self.replicator
                    .notify_changed(transport, store, &network_id, &changed);
            self.replicator
                .send_pool_credits(transport, &settlement.pool_grants);

            report.changed.extend(changed);
            for observer in notified {
                if !report.notified.contains(&observer) {
                    report.notified.push(observer);
                }
            }
        }

        report
    }

    /// Apply a settlement's commits to registry state. Returns the ids
    /// whose persisted values actually moved against their pre-tick
    /// snapshot; only those get saved and replicated.
    fn apply_settlement(&mut self, settlement: &Settlement) -> Vec<RecordId> {
        let mut changed = Vec::new();

        let mut touched: Vec<RecordId> = settlement
            .storage_commits
            .iter()
            .chain(&settlement.storage_refills)
            .chain(&settlement.source_commits)
            .map(|(id, _)| *id)
            .collect();
        touched.sort_unstable();
        touched.dedup();

        let amount_for = |list: &[(RecordId, f32)], id: RecordId| {
            list.iter()
                .find(|(other, _)| *other == id)
                .map(|(_, a)| *a)
                .unwrap_or(0.0)
        };

        for id in touched {
            let Some(entry) = self.registry.get_mut(id) else {
                continue;
            };
            match &mut entry.data.role {
                RoleState::Storage(storage) => {
                    let pre = storage.energy;
                    storage.commit_discharge(amount_for(&settlement.storage_commits, id));
                    storage.refill(amount_for(&settlement.storage_refills, id));
                    if storage.energy != pre {
                        entry.persist.mark_dirty(Field::Energy);
                        changed.push(id);
                    }
                }
                RoleState::Source(source) => {
                    let pre = source.fuel;
                    source.commit(amount_for(&settlement.source_commits, id));
                    if source.fuel != pre {
                        entry.persist.mark_dirty(Field::Fuel);
                        changed.push(id);
                    }
                }
                _ => {}
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powernet_logic::geometry::Vec3;

    use crate::record::{keys, FieldValue, MemoryStore};
    use crate::replication::LoopbackTransport;

    /// One generator and one machine 5 units apart, ready to tick.
    fn small_grid() -> (PowerSystem, MemoryStore, LoopbackTransport) {
        let mut system = PowerSystem::new(PowerConfig::default());
        let mut store = MemoryStore::new();
        let mut transport = LoopbackTransport::new();
        system.replicator.bind(&mut transport);

        store.insert(1, Vec3::new(0.0, 0.0, 0.0));
        store.set(1, keys::FUEL, FieldValue::Float(10.0));
        store.set(1, keys::FUEL_OUTPUT_RATE, FieldValue::Float(5.0));
        store.insert(2, Vec3::new(5.0, 0.0, 0.0));
        store.set(2, keys::IS_DEMANDING, FieldValue::Bool(true));

        assert!(system.observe_record_loaded(&store, 1, PrefabKind::Generator));
        assert!(system.observe_record_loaded(&store, 2, PrefabKind::Machine));
        (system, store, transport)
    }

    #[test]
    fn test_tick_meets_demand_and_persists_fuel() {
        let (mut system, mut store, mut transport) = small_grid();
        let report = system.tick(&mut store, &mut transport, 1.0);

        assert_eq!(report.networks, 1);
        assert_eq!(report.consumer_grants, vec![(2, 3.0)]);
        assert_eq!(report.changed, vec![1]);
        // Fuel burned exactly what the consumer drew, and it is on the
        // record already.
        assert_eq!(store.get(1, keys::FUEL).and_then(|v| v.as_float()), Some(7.0));
    }

    #[test]
    fn test_idle_network_changes_nothing() {
        let (mut system, mut store, mut transport) = small_grid();
        if let Some(consumer) = system
            .registry
            .get_mut(2)
            .and_then(|entry| entry.data.as_consumer_mut())
        {
            consumer.is_demanding = false;
        }
        let report = system.tick(&mut store, &mut transport, 1.0);
        assert!(report.changed.is_empty());
        assert_eq!(store.get(1, keys::FUEL).and_then(|v| v.as_float()), Some(10.0));
    }

    #[test]
    fn test_nearby_observer_notified_far_observer_not() {
        let (mut system, mut store, mut transport) = small_grid();
        system.replicator.update_observer(100, Vec3::new(20.0, 0.0, 0.0));
        system.replicator.update_observer(200, Vec3::new(300.0, 0.0, 0.0));

        let report = system.tick(&mut store, &mut transport, 1.0);
        assert_eq!(report.notified, vec![100]);
        assert_eq!(transport.drain(100).len(), 1);
        assert!(transport.drain(200).is_empty());
    }

    #[test]
    fn test_failed_entity_stops_contributing() {
        let (mut system, mut store, mut transport) = small_grid();
        system.tick(&mut store, &mut transport, 1.0); // fuel 10 -> 7

        // The host destroys the generator's record behind our back. No
        // membership change, so no rebuild: the next pass still sees the
        // cached source, burns its fuel, and the save latches it invalid.
        store.remove(1);
        let report = system.tick(&mut store, &mut transport, 1.0);
        assert_eq!(report.consumer_grants, vec![(2, 3.0)]);
        assert!(system.registry.get(1).unwrap().persist.is_invalid());

        // From then on the invalid source is treated as absent.
        let report = system.tick(&mut store, &mut transport, 1.0);
        assert_eq!(report.consumer_grants, vec![(2, 0.0)]);
        assert!(report.changed.is_empty());
    }

    #[test]
    fn test_rebuild_runs_before_first_pass() {
        let (mut system, mut store, mut transport) = small_grid();
        // Both entities registered but never clustered yet.
        assert!(system.registry.get(1).unwrap().data.network_id.is_empty());
        system.tick(&mut store, &mut transport, 1.0);
        let net1 = system.registry.get(1).unwrap().data.network_id.clone();
        let net2 = system.registry.get(2).unwrap().data.network_id.clone();
        assert!(!net1.is_empty());
        assert_eq!(net1, net2);
    }

    #[test]
    fn test_storage_refill_is_persisted_and_replicated() {
        let mut system = PowerSystem::new(PowerConfig::default());
        let mut store = MemoryStore::new();
        let mut transport = LoopbackTransport::new();
        system.replicator.bind(&mut transport);

        store.insert(1, Vec3::new(0.0, 0.0, 0.0));
        store.set(1, keys::FUEL, FieldValue::Float(50.0));
        store.set(1, keys::FUEL_OUTPUT_RATE, FieldValue::Float(5.0));
        store.insert(2, Vec3::new(4.0, 0.0, 0.0));
        store.set(2, keys::ENERGY, FieldValue::Float(10.0));
        store.set(2, keys::ENERGY_CAPACITY, FieldValue::Float(100.0));
        system.observe_record_loaded(&store, 1, PrefabKind::Generator);
        system.observe_record_loaded(&store, 2, PrefabKind::Battery);

        let report = system.tick(&mut store, &mut transport, 1.0);
        let mut changed = report.changed.clone();
        changed.sort_unstable();
        assert_eq!(changed, vec![1, 2]);
        assert_eq!(store.get(2, keys::ENERGY).and_then(|v| v.as_float()), Some(15.0));
        assert_eq!(store.get(1, keys::FUEL).and_then(|v| v.as_float()), Some(45.0));
    }
}
