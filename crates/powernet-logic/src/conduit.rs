//! Observer resource-pool conduits.
//!
//! A conduit bridges the network and the personal energy pools of nearby
//! observers (remote peers). The conduit only ever sees a cached copy of
//! each pool, refreshed by pool-offer messages; the pool itself is owned
//! and mutated by the remote peer in response to committed RPCs.
//!
//! Drain mode moves network energy out toward observer pools. Charge mode
//! is counted in demand aggregation but its settlement path yields zero;
//! the inverse transfer is an acknowledged gap carried over from the
//! original design.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Transfer direction of a conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConduitMode {
    #[default]
    Charge,
    Drain,
}

/// Cached view of one observer's personal energy pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverPool {
    pub amount: f32,
    pub capacity: f32,
}

impl ObserverPool {
    /// Energy this pool could still absorb.
    pub fn deficit(&self) -> f32 {
        (self.capacity - self.amount).max(0.0)
    }
}

/// State of one conduit.
///
/// Pools are keyed by observer id in a `BTreeMap` so every iteration over
/// them is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConduitState {
    pub mode: ConduitMode,
    pub pools: BTreeMap<i64, ObserverPool>,
}

impl ConduitState {
    pub fn new(mode: ConduitMode) -> Self {
        Self {
            mode,
            pools: BTreeMap::new(),
        }
    }

    /// Record the pool levels an observer reported in a pool offer.
    pub fn update_pool(&mut self, observer: i64, amount: f32, capacity: f32) {
        self.pools.insert(observer, ObserverPool { amount, capacity });
    }

    /// Drop an observer whose reference no longer resolves.
    pub fn remove_pool(&mut self, observer: i64) {
        self.pools.remove(&observer);
    }

    /// Total deficit across connected pools. This is the conduit's
    /// contribution to demand aggregation, in either mode.
    pub fn pool_deficit(&self) -> f32 {
        self.pools.values().map(ObserverPool::deficit).sum()
    }

    /// Settlement for a drain-mode conduit: split `available` energy
    /// across observers pro rata by deficit, each share capped at that
    /// observer's deficit. Returns `(observer, amount)` grants in
    /// observer-id order. Cached amounts are not touched: the pool is
    /// remote-owned and only moves via the request/commit RPC.
    pub fn drain_shares(&self, available: f32) -> Vec<(i64, f32)> {
        let total = self.pool_deficit();
        if self.mode != ConduitMode::Drain || total <= 0.0 || available <= 0.0 {
            return Vec::new();
        }
        let pot = available.min(total);
        self.pools
            .iter()
            .filter(|(_, pool)| pool.deficit() > 0.0)
            .map(|(&observer, pool)| {
                let share = (pot * pool.deficit() / total).min(pool.deficit());
                (observer, share)
            })
            .collect()
    }

    /// Settlement for a charge-mode conduit. Explicitly yields nothing;
    /// the reverse transfer path was never wired up in the original and
    /// the gap is carried deliberately.
    pub fn charge_settle(&self) -> f32 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conduit(mode: ConduitMode, pools: &[(i64, f32, f32)]) -> ConduitState {
        let mut c = ConduitState::new(mode);
        for &(id, amount, capacity) in pools {
            c.update_pool(id, amount, capacity);
        }
        c
    }

    #[test]
    fn test_pool_deficit_sums_and_floors() {
        let c = conduit(ConduitMode::Drain, &[(1, 20.0, 100.0), (2, 100.0, 100.0)]);
        assert_eq!(c.pool_deficit(), 80.0);
    }

    #[test]
    fn test_drain_shares_pro_rata() {
        let c = conduit(ConduitMode::Drain, &[(1, 40.0, 100.0), (2, 80.0, 100.0)]);
        // Deficits: 60 and 20. Available 40 splits 30 / 10.
        let shares = c.drain_shares(40.0);
        assert_eq!(shares, vec![(1, 30.0), (2, 10.0)]);
    }

    #[test]
    fn test_drain_shares_capped_at_deficit() {
        let c = conduit(ConduitMode::Drain, &[(1, 90.0, 100.0)]);
        let shares = c.drain_shares(50.0);
        assert_eq!(shares, vec![(1, 10.0)]);
    }

    #[test]
    fn test_charge_mode_settles_to_zero() {
        let c = conduit(ConduitMode::Charge, &[(1, 0.0, 100.0)]);
        assert!(c.drain_shares(50.0).is_empty());
        assert_eq!(c.charge_settle(), 0.0);
        // The deficit still counts toward demand aggregation.
        assert_eq!(c.pool_deficit(), 100.0);
    }

    #[test]
    fn test_removed_pool_stops_counting() {
        let mut c = conduit(ConduitMode::Drain, &[(1, 0.0, 50.0), (2, 0.0, 50.0)]);
        assert_eq!(c.pool_deficit(), 100.0);
        c.remove_pool(1);
        assert_eq!(c.pool_deficit(), 50.0);
        assert_eq!(c.drain_shares(80.0), vec![(2, 50.0)]);
    }

    #[test]
    fn test_full_pools_get_no_share() {
        let c = conduit(ConduitMode::Drain, &[(1, 100.0, 100.0), (2, 50.0, 100.0)]);
        let shares = c.drain_shares(20.0);
        assert_eq!(shares, vec![(2, 20.0)]);
    }
}
