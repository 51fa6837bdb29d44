//! Owned registry of power-network entities.
//!
//! Maps persisted-record identity to compute data and keeps typed lookup
//! lists per role. The registry is plain owned state, constructed by the
//! host and injected into the cluster manager and the engine; nothing here
//! is global. Every membership change raises a rebuild flag that the
//! cluster manager consumes between ticks; mutations never rebuild
//! inline.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use powernet_logic::entity::{ComputeData, EntityRole};

use crate::bridge::PersistTracker;
use crate::record::RecordId;

/// One registered entity: record identity paired with exactly one compute
/// data instance plus its persistence tracker. Identity is the record id;
/// equality and hashing ignore the payload.
#[derive(Debug)]
pub struct EntityEntry {
    pub id: RecordId,
    pub data: ComputeData,
    pub persist: PersistTracker,
}

impl PartialEq for EntityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityEntry {}

impl Hash for EntityEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Registry of all live power-network entities.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<RecordId, EntityEntry>,
    sources: Vec<RecordId>,
    storages: Vec<RecordId>,
    consumers: Vec<RecordId>,
    conduits: Vec<RecordId>,
    /// Lazily-built lists for roles without a precomputed index.
    other_cache: HashMap<EntityRole, Vec<RecordId>>,
    rebuild_needed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register compute data under a record id. A record that is already
    /// registered is left untouched (silent no-op, returns false). Any
    /// successful registration schedules a cluster rebuild.
    pub fn register(&mut self, id: RecordId, data: ComputeData) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        match data.role() {
            EntityRole::Source => self.sources.push(id),
            EntityRole::Storage => self.storages.push(id),
            EntityRole::Consumer => self.consumers.push(id),
            EntityRole::Conduit => self.conduits.push(id),
            EntityRole::Pylon => {}
        }
        self.entries.insert(
            id,
            EntityEntry {
                id,
                data,
                persist: PersistTracker::new(),
            },
        );
        self.other_cache.clear();
        self.rebuild_needed = true;
        true
    }

    /// Remove a record from every index. Schedules a rebuild even when the
    /// id was unknown, which guards against an index that drifted out of
    /// sync with the host.
    pub fn unregister(&mut self, id: RecordId) {
        if let Some(entry) = self.entries.remove(&id) {
            let list = match entry.data.role() {
                EntityRole::Source => Some(&mut self.sources),
                EntityRole::Storage => Some(&mut self.storages),
                EntityRole::Consumer => Some(&mut self.consumers),
                EntityRole::Conduit => Some(&mut self.conduits),
                EntityRole::Pylon => None,
            };
            if let Some(list) = list {
                list.retain(|&other| other != id);
            }
        }
        self.other_cache.clear();
        self.rebuild_needed = true;
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: RecordId) -> Option<&EntityEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    /// Ids of every entity playing `role`. The four common roles are
    /// precomputed; anything else comes from a lazily-built cache that is
    /// dropped on the next membership change.
    pub fn ids_of_role(&mut self, role: EntityRole) -> &[RecordId] {
        match role {
            EntityRole::Source => self.sources.as_slice(),
            EntityRole::Storage => self.storages.as_slice(),
            EntityRole::Consumer => self.consumers.as_slice(),
            EntityRole::Conduit => self.conduits.as_slice(),
            other => {
                let entries = &self.entries;
                self.other_cache
                    .entry(other)
                    .or_insert_with(|| {
                        let mut ids: Vec<RecordId> = entries
                            .values()
                            .filter(|e| e.data.role() == other)
                            .map(|e| e.id)
                            .collect();
                        ids.sort_unstable();
                        ids
                    })
                    .as_slice()
            }
        }
    }

    /// Consume the rebuild flag. The cluster manager calls this once per
    /// tick so a burst of membership changes collapses into one rebuild.
    pub fn take_rebuild_needed(&mut self) -> bool {
        std::mem::take(&mut self.rebuild_needed)
    }

    pub fn rebuild_needed(&self) -> bool {
        self.rebuild_needed
    }
}

/// Outcome of polling a [`PendingLookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Resolved,
    Pending,
    TimedOut,
}

/// Bounded-retry wait for an entity to appear in the registry.
///
/// Callers poll once per frame; after the attempt budget is exhausted the
/// lookup reports a timeout and the caller must tolerate absence. There is
/// no blocking wait anywhere.
#[derive(Debug)]
pub struct PendingLookup {
    id: RecordId,
    attempts_left: u32,
}

impl PendingLookup {
    pub fn new(id: RecordId, attempt_budget: u32) -> Self {
        Self {
            id,
            attempts_left: attempt_budget,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Spend one attempt. Resolves as soon as the registry holds the id.
    pub fn poll(&mut self, registry: &Registry) -> LookupState {
        if registry.contains(self.id) {
            return LookupState::Resolved;
        }
        if self.attempts_left == 0 {
            return LookupState::TimedOut;
        }
        self.attempts_left -= 1;
        if self.attempts_left == 0 {
            LookupState::TimedOut
        } else {
            LookupState::Pending
        }
    }
}
