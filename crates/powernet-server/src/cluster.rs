//! Proximity clustering of registered entities into networks.
//!
//! A rebuild partitions every registered record into connected components
//! under the proximity relation: two records join when a chain of pairwise
//! in-range hops links them (transitive closure, not root distance). Each
//! component gets a freshly minted network id which is written onto every
//! member's record; the record is authoritative, the in-memory copy is a
//! read accelerator.
//!
//! The scan is intentionally O(n²): rebuilds run only on membership change,
//! which is rare next to per-tick simulation. Rebuilding never fails; a
//! record with no neighbor in range simply forms a singleton network, and a
//! component spanning an implausible distance is logged, not rejected.

use std::collections::VecDeque;

use powernet_logic::config::PowerConfig;
use powernet_logic::entity::EntityRole;
use powernet_logic::geometry::Vec3;
use powernet_logic::resolve::NetworkView;

use crate::record::{keys, FieldValue, RecordId, RecordStore};
use crate::registry::Registry;

/// Simulation-ready snapshot of one network: member ids split by role.
/// Cached per network id until the next rebuild invalidates it.
#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshot {
    pub sources: Vec<RecordId>,
    pub storages: Vec<RecordId>,
    pub consumers: Vec<RecordId>,
    pub conduits: Vec<RecordId>,
    pub pylons: Vec<RecordId>,
}

impl NetworkSnapshot {
    pub fn members(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.sources
            .iter()
            .chain(&self.storages)
            .chain(&self.consumers)
            .chain(&self.conduits)
            .chain(&self.pylons)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
            + self.storages.len()
            + self.consumers.len()
            + self.conduits.len()
            + self.pylons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one rebuild pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildStats {
    pub networks: usize,
    pub entities: usize,
}

/// Groups registered entities into networks and caches per-network
/// simulation snapshots.
#[derive(Debug, Default)]
pub struct ClusterManager {
    config: PowerConfig,
    snapshots: std::collections::HashMap<String, NetworkSnapshot>,
    next_seq: u64,
}

impl ClusterManager {
    pub fn new(config: PowerConfig) -> Self {
        Self {
            config,
            snapshots: std::collections::HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Mint a globally-unique network id.
    fn mint_network_id(&mut self) -> String {
        let suffix: u32 = rand::random();
        let id = format!("net-{}-{:08x}", self.next_seq, suffix);
        self.next_seq += 1;
        id
    }

    /// Rebuild if and only if the registry has pending membership changes.
    pub fn maybe_rebuild(
        &mut self,
        registry: &mut Registry,
        store: &mut dyn RecordStore,
    ) -> Option<RebuildStats> {
        if registry.take_rebuild_needed() {
            Some(self.rebuild(registry, store))
        } else {
            None
        }
    }

    /// Unconditionally repartition every registered record.
    ///
    /// BFS flood-fill over an unvisited set: pop a root, mint a fresh id,
    /// and expand the frontier with every unvisited record in range of any
    /// already-claimed member. Records whose position cannot be resolved
    /// are skipped for this pass; the validity guard deals with them at
    /// persistence time.
    pub fn rebuild(&mut self, registry: &mut Registry, store: &mut dyn RecordStore) -> RebuildStats {
        let mut unvisited: Vec<(RecordId, Vec3, f32)> = registry
            .entries()
            .filter_map(|entry| {
                store
                    .position(entry.id)
                    .map(|pos| (entry.id, pos, entry.data.connection_range))
            })
            .collect();
        // Deterministic roots make rebuilds reproducible for tests.
        unvisited.sort_unstable_by_key(|(id, _, _)| *id);

        let mut stats = RebuildStats {
            networks: 0,
            entities: unvisited.len(),
        };

        while let Some(root) = unvisited.first().copied() {
            unvisited.remove(0);
            let network_id = self.mint_network_id();
            let (root_id, root_pos, _) = root;
            let mut queue = VecDeque::new();
            queue.push_back(root);
            let mut max_span_sq: f32 = 0.0;

            while let Some((id, pos, range)) = queue.pop_front() {
                self.assign(registry, store, id, &network_id);
                max_span_sq = max_span_sq.max(root_pos.dist_sq(&pos));

                // Transitive closure: the frontier record's own reach
                // decides who joins, so relays like pylons extend the
                // network beyond the base join threshold.
                let reach = range.max(self.config.join_distance);
                let reach_sq = reach * reach;
                let mut i = 0;
                while i < unvisited.len() {
                    if unvisited[i].1.dist_sq(&pos) <= reach_sq {
                        queue.push_back(unvisited.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }

            let warn = self.config.cluster_span_warn;
            if max_span_sq > warn * warn {
                log::warn!(
                    "power network {} spans {:.1} units from root {} (bound {}), check entity data",
                    network_id,
                    max_span_sq.sqrt(),
                    root_id,
                    warn
                );
            }
            stats.networks += 1;
        }

        // Every snapshot is stale after a repartition.
        self.snapshots.clear();
        stats
    }

    /// Write a network id onto a member: record first (authoritative),
    /// then the in-memory accelerator.
    fn assign(
        &mut self,
        registry: &mut Registry,
        store: &mut dyn RecordStore,
        id: RecordId,
        network_id: &str,
    ) {
        store.set(id, keys::NETWORK_ID, FieldValue::Str(network_id.to_string()));
        if let Some(entry) = registry.get_mut(id) {
            entry.data.network_id = network_id.to_string();
        }
    }

    /// Distinct network ids currently present in the registry, sorted.
    /// Entities that have never been clustered (empty id) are excluded.
    pub fn network_ids(&self, registry: &Registry) -> Vec<String> {
        let mut ids: Vec<String> = registry
            .entries()
            .map(|entry| entry.data.network_id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Simulation snapshot for one network, built lazily and cached until
    /// the next rebuild.
    pub fn snapshot(&mut self, registry: &Registry, network_id: &str) -> &NetworkSnapshot {
        if !self.snapshots.contains_key(network_id) {
            let mut snapshot = NetworkSnapshot::default();
            let mut members: Vec<&crate::registry::EntityEntry> = registry
                .entries()
                .filter(|entry| entry.data.network_id == network_id)
                .collect();
            members.sort_unstable_by_key(|entry| entry.id);
            for entry in members {
                match entry.data.role() {
                    EntityRole::Source => snapshot.sources.push(entry.id),
                    EntityRole::Storage => snapshot.storages.push(entry.id),
                    EntityRole::Consumer => snapshot.consumers.push(entry.id),
                    EntityRole::Conduit => snapshot.conduits.push(entry.id),
                    EntityRole::Pylon => snapshot.pylons.push(entry.id),
                }
            }
            self.snapshots.insert(network_id.to_string(), snapshot);
        }
        &self.snapshots[network_id]
    }

    /// Copy a network's live, valid member state into a resolution view.
    /// Inactive entities, invalid entities, and ids that no longer resolve
    /// contribute nothing; a hazard inside one entity must never leak
    /// into settlement.
    pub fn view(&mut self, registry: &Registry, network_id: &str) -> NetworkView {
        let snapshot = self.snapshot(registry, network_id).clone();
        let mut view = NetworkView::default();
        for id in snapshot.members() {
            let Some(entry) = registry.get(id) else {
                continue;
            };
            if !entry.data.is_active || entry.persist.is_invalid() {
                continue;
            }
            match entry.data.role() {
                EntityRole::Source => {
                    if let Some(s) = entry.data.as_source() {
                        view.sources.push((id, *s));
                    }
                }
                EntityRole::Storage => {
                    if let Some(s) = entry.data.as_storage() {
                        view.storages.push((id, *s));
                    }
                }
                EntityRole::Consumer => {
                    if let Some(c) = entry.data.as_consumer() {
                        view.consumers.push((id, *c));
                    }
                }
                EntityRole::Conduit => {
                    if let Some(c) = entry.data.as_conduit() {
                        view.conduits.push((id, c.clone()));
                    }
                }
                EntityRole::Pylon => {}
            }
        }
        view
    }
}
