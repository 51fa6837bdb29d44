//! Two-phase supply/demand settlement for one network.
//!
//! The resolution never mutates entity state directly. It takes a copied
//! view of a network, peeks what storages and sources could contribute,
//! plans who receives what, and returns a [`Settlement`] the caller commits
//! afterwards. Committing from the plan guarantees the peeked amounts are
//! honored at most once and nothing is double-spent.
//!
//! Intra-tick ordering is fixed: demand aggregation, storage discharge
//! peek, source offer peek, settlement, commit. Storages discharge only
//! toward direct demand (consumers and conduits); sources offer toward
//! direct demand plus storage refill, so storage discharge can never fund
//! another storage's refill.

use serde::{Deserialize, Serialize};

use crate::conduit::ConduitState;
use crate::consumer::ConsumerState;
use crate::source::SourceState;
use crate::storage::StorageState;

/// Copied per-role state of one network, keyed by record id.
#[derive(Debug, Clone, Default)]
pub struct NetworkView {
    pub sources: Vec<(u64, SourceState)>,
    pub storages: Vec<(u64, StorageState)>,
    pub consumers: Vec<(u64, ConsumerState)>,
    pub conduits: Vec<(u64, ConduitState)>,
}

impl NetworkView {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
            && self.storages.is_empty()
            && self.consumers.is_empty()
            && self.conduits.is_empty()
    }
}

/// A planned credit to one observer's pool through a drain conduit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolGrant {
    pub conduit: u64,
    pub observer: i64,
    pub amount: f32,
}

/// The outcome of resolving one network for one tick.
///
/// All lists are keyed by record id and ordered deterministically. Commits
/// are bounded by the matching peeks by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settlement {
    /// Demand from consumers plus conduit pool deficits.
    pub direct_demand: f32,
    /// Demand from storages wanting to reach capacity.
    pub refill_demand: f32,
    /// What each storage peeked it could discharge.
    pub discharge_peeks: Vec<(u64, f32)>,
    /// What each source offered.
    pub source_offers: Vec<(u64, f32)>,
    /// Discharge offers plus source offers.
    pub total_available: f32,
    /// Energy granted to each consumer.
    pub consumer_grants: Vec<(u64, f32)>,
    /// Energy granted to observer pools through drain conduits.
    pub pool_grants: Vec<PoolGrant>,
    /// Discharge each storage must commit.
    pub storage_commits: Vec<(u64, f32)>,
    /// Fuel burn each source must commit.
    pub source_commits: Vec<(u64, f32)>,
    /// Refill each storage absorbs from leftover source energy.
    pub storage_refills: Vec<(u64, f32)>,
}

impl Settlement {
    pub fn total_demand(&self) -> f32 {
        self.direct_demand + self.refill_demand
    }

    /// Total energy handed out this tick.
    pub fn total_granted(&self) -> f32 {
        let consumers: f32 = self.consumer_grants.iter().map(|(_, a)| a).sum();
        let pools: f32 = self.pool_grants.iter().map(|g| g.amount).sum();
        let refills: f32 = self.storage_refills.iter().map(|(_, a)| a).sum();
        consumers + pools + refills
    }

    /// Total energy committed by storages and sources this tick.
    pub fn total_committed(&self) -> f32 {
        let storages: f32 = self.storage_commits.iter().map(|(_, a)| a).sum();
        let sources: f32 = self.source_commits.iter().map(|(_, a)| a).sum();
        storages + sources
    }
}

/// Storages ordered for discharge: descending energy, record id as the
/// deterministic tie-break.
fn discharge_order(storages: &[(u64, StorageState)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..storages.len()).collect();
    order.sort_by(|&a, &b| {
        storages[b]
            .1
            .energy
            .partial_cmp(&storages[a].1.energy)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| storages[a].0.cmp(&storages[b].0))
    });
    order
}

/// Walk an offer list in order, consuming `needed` from it. Returns the
/// per-entry commits.
fn allocate(offers: &[(u64, f32)], mut needed: f32) -> Vec<(u64, f32)> {
    let mut commits = Vec::new();
    for &(id, offered) in offers {
        if needed <= 0.0 {
            break;
        }
        let take = offered.min(needed);
        if take > 0.0 {
            commits.push((id, take));
            needed -= take;
        }
    }
    commits
}

/// Resolve one network for a tick of `dt`.
///
/// Returns an empty settlement when total demand is zero: no peek, no
/// offer, no commit. A network with no storages and no sources settles
/// every demander at zero.
pub fn resolve(dt: f32, view: &NetworkView) -> Settlement {
    let mut settlement = Settlement::default();

    // Phase 1: demand aggregation.
    let consumer_demands: Vec<(u64, f32)> = view
        .consumers
        .iter()
        .map(|(id, c)| (*id, c.requested_power(dt)))
        .collect();
    let consumer_demand: f32 = consumer_demands.iter().map(|(_, d)| d).sum();
    let conduit_demand: f32 = view.conduits.iter().map(|(_, c)| c.pool_deficit()).sum();
    settlement.direct_demand = consumer_demand + conduit_demand;
    settlement.refill_demand = view.storages.iter().map(|(_, s)| s.refill_request()).sum();

    if settlement.total_demand() <= 0.0 {
        return settlement;
    }

    // Phase 2: storage discharge peek, toward direct demand only.
    let order = discharge_order(&view.storages);
    let mut remaining_direct = settlement.direct_demand;
    for &i in &order {
        let (id, storage) = &view.storages[i];
        let peek = storage.peek_discharge(remaining_direct);
        if peek > 0.0 {
            settlement.discharge_peeks.push((*id, peek));
            remaining_direct -= peek;
        }
    }
    let discharge_total: f32 = settlement.discharge_peeks.iter().map(|(_, a)| a).sum();

    // Phase 3: source offer peek, toward everything still unmet.
    let mut remaining_total = settlement.total_demand() - discharge_total;
    for (id, source) in &view.sources {
        let offered = source.offer(remaining_total, true, dt);
        if offered > 0.0 {
            settlement.source_offers.push((*id, offered));
            remaining_total -= offered;
        }
    }
    let source_total: f32 = settlement.source_offers.iter().map(|(_, a)| a).sum();
    settlement.total_available = discharge_total + source_total;

    // Phase 4: settlement. Consumers first, then drain-conduit pools,
    // then storage refill from whatever source energy is left.
    let mut left = settlement.total_available;

    if consumer_demand > 0.0 {
        let granted = consumer_demand.min(left);
        let scale = granted / consumer_demand;
        for (id, demand) in &consumer_demands {
            if *demand > 0.0 {
                settlement.consumer_grants.push((*id, demand * scale));
            }
        }
        left -= granted;
    }

    for (id, conduit) in &view.conduits {
        if left <= 0.0 {
            break;
        }
        let shares = conduit.drain_shares(left);
        let granted: f32 = shares.iter().map(|(_, a)| a).sum();
        for (observer, amount) in shares {
            settlement.pool_grants.push(PoolGrant {
                conduit: *id,
                observer,
                amount,
            });
        }
        left -= granted;
    }

    // Direct usage splits across storages first, sources for the rest.
    let consumer_granted: f32 = settlement.consumer_grants.iter().map(|(_, a)| a).sum();
    let pool_granted: f32 = settlement.pool_grants.iter().map(|g| g.amount).sum();
    let direct_used = consumer_granted + pool_granted;
    settlement.storage_commits = allocate(&settlement.discharge_peeks, direct_used.min(discharge_total));
    let storage_committed: f32 = settlement.storage_commits.iter().map(|(_, a)| a).sum();
    let source_used_direct = (direct_used - storage_committed).max(0.0);

    // Refill draws only on leftover source energy, walked in the same
    // deterministic order the discharge peek used.
    let mut refill_pot = (source_total - source_used_direct).max(0.0);
    for &i in &order {
        if refill_pot <= 0.0 {
            break;
        }
        let (id, storage) = &view.storages[i];
        let committed = settlement
            .storage_commits
            .iter()
            .find(|(cid, _)| cid == id)
            .map(|(_, a)| *a)
            .unwrap_or(0.0);
        let want = (storage.energy_capacity - (storage.energy - committed)).max(0.0);
        let fill = want.min(refill_pot);
        if fill > 0.0 {
            settlement.storage_refills.push((*id, fill));
            refill_pot -= fill;
        }
    }
    let refill_used: f32 = settlement.storage_refills.iter().map(|(_, a)| a).sum();

    settlement.source_commits = allocate(&settlement.source_offers, source_used_direct + refill_used);

    settlement
}

/// Apply a settlement's commits to the view's states. Pool grants are not
/// applied here; observer pools are remote-owned and only move through
/// the request/commit RPC.
pub fn apply(view: &mut NetworkView, settlement: &Settlement) {
    for (id, amount) in &settlement.storage_commits {
        if let Some((_, storage)) = view.storages.iter_mut().find(|(sid, _)| sid == id) {
            storage.commit_discharge(*amount);
        }
    }
    for (id, amount) in &settlement.source_commits {
        if let Some((_, source)) = view.sources.iter_mut().find(|(sid, _)| sid == id) {
            source.commit(*amount);
        }
    }
    for (id, amount) in &settlement.storage_refills {
        if let Some((_, storage)) = view.storages.iter_mut().find(|(sid, _)| sid == id) {
            storage.refill(*amount);
        }
    }
}

/// Summary of the single-pass strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassSummary {
    pub consumer_grants: Vec<(u64, f32)>,
    pub pool_grants: Vec<PoolGrant>,
    pub supplied_by_sources: f32,
    pub supplied_by_storages: f32,
    pub refilled: f32,
}

impl PassSummary {
    pub fn total_granted(&self) -> f32 {
        let consumers: f32 = self.consumer_grants.iter().map(|(_, a)| a).sum();
        let pools: f32 = self.pool_grants.iter().map(|g| g.amount).sum();
        consumers + pools + self.refilled
    }
}

/// Simpler single-pass strategy for synchronous callers: consumers,
/// conduits, sources, and storages are walked once with a shared
/// supply/demand accumulator and state is mutated in place. Preserves the
/// same conservation invariant as [`resolve`]: energy handed out never
/// exceeds energy drawn from sources and storages.
pub fn resolve_single_pass(dt: f32, view: &mut NetworkView) -> PassSummary {
    let mut summary = PassSummary::default();

    let consumer_demands: Vec<(u64, f32)> = view
        .consumers
        .iter()
        .map(|(id, c)| (*id, c.requested_power(dt)))
        .collect();
    let consumer_demand: f32 = consumer_demands.iter().map(|(_, d)| d).sum();
    let conduit_demand: f32 = view.conduits.iter().map(|(_, c)| c.pool_deficit()).sum();
    let direct_demand = consumer_demand + conduit_demand;
    let refill_demand: f32 = view.storages.iter().map(|(_, s)| s.refill_request()).sum();
    if direct_demand + refill_demand <= 0.0 {
        return summary;
    }

    // Sources produce toward everything, burning fuel as they go.
    let mut remaining = direct_demand + refill_demand;
    let mut available = 0.0;
    for (_, source) in &mut view.sources {
        let produced = source.offer(remaining, true, dt);
        source.commit(produced);
        available += produced;
        remaining -= produced;
    }
    summary.supplied_by_sources = available;

    // Storages cover whatever direct demand the sources could not.
    let mut unmet_direct = (direct_demand - available).max(0.0);
    let order = discharge_order(&view.storages);
    for &i in &order {
        if unmet_direct <= 0.0 {
            break;
        }
        let (_, storage) = &mut view.storages[i];
        let drawn = storage.commit_discharge(storage.peek_discharge(unmet_direct));
        summary.supplied_by_storages += drawn;
        available += drawn;
        unmet_direct -= drawn;
    }

    // Grant consumers pro rata, then drain-conduit pools, then refill.
    let mut left = available;
    if consumer_demand > 0.0 {
        let granted = consumer_demand.min(left);
        let scale = granted / consumer_demand;
        for (id, demand) in &consumer_demands {
            if *demand > 0.0 {
                summary.consumer_grants.push((*id, demand * scale));
            }
        }
        left -= granted;
    }
    for (id, conduit) in &view.conduits {
        if left <= 0.0 {
            break;
        }
        let shares = conduit.drain_shares(left);
        let granted: f32 = shares.iter().map(|(_, a)| a).sum();
        for (observer, amount) in shares {
            summary.pool_grants.push(PoolGrant {
                conduit: *id,
                observer,
                amount,
            });
        }
        left -= granted;
    }
    // Only energy that came from sources may refill storages.
    let mut refill_pot = left.min(summary.supplied_by_sources);
    for &i in &order {
        if refill_pot <= 0.0 {
            break;
        }
        let (_, storage) = &mut view.storages[i];
        let absorbed = storage.refill(refill_pot);
        summary.refilled += absorbed;
        refill_pot -= absorbed;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::{ConduitMode, ConduitState};
    use crate::consumer::ConsumerState;

    fn demanding_consumer(base: f32) -> ConsumerState {
        let mut c = ConsumerState::new(base);
        c.is_demanding = true;
        c
    }

    fn source(fuel: f32, rate: f32) -> SourceState {
        let mut s = SourceState::new(1000.0, rate);
        s.fuel = fuel;
        s
    }

    fn storage(energy: f32, capacity: f32) -> StorageState {
        let mut s = StorageState::new(capacity);
        s.energy = energy;
        s
    }

    fn amount_for(list: &[(u64, f32)], id: u64) -> f32 {
        list.iter().find(|(i, _)| *i == id).map(|(_, a)| *a).unwrap_or(0.0)
    }

    #[test]
    fn test_source_meets_consumer_and_burns_exactly_committed() {
        // Fuel 10, rate 5/tick, one consumer demanding 3/tick.
        let mut view = NetworkView::default();
        view.sources.push((1, source(10.0, 5.0)));
        view.consumers.push((2, demanding_consumer(3.0)));

        let settlement = resolve(1.0, &view);
        assert_eq!(amount_for(&settlement.consumer_grants, 2), 3.0);
        assert_eq!(amount_for(&settlement.source_commits, 1), 3.0);
        assert!(settlement.storage_refills.is_empty(), "no storage, no refill");

        apply(&mut view, &settlement);
        assert_eq!(view.sources[0].1.fuel, 7.0);
    }

    #[test]
    fn test_discharge_order_favors_higher_energy() {
        // Two storages (0/100 and 50/100), no sources, demand 60.
        let mut view = NetworkView::default();
        view.storages.push((1, storage(0.0, 100.0)));
        view.storages.push((2, storage(50.0, 100.0)));
        view.consumers.push((3, demanding_consumer(60.0)));

        let settlement = resolve(1.0, &view);
        assert_eq!(settlement.total_available, 50.0);
        assert_eq!(amount_for(&settlement.consumer_grants, 3), 50.0);
        assert_eq!(amount_for(&settlement.storage_commits, 2), 50.0);
        assert_eq!(amount_for(&settlement.storage_commits, 1), 0.0);

        apply(&mut view, &settlement);
        assert!(view.storages[0].1.energy >= 0.0);
        assert!(view.storages[1].1.energy >= 0.0);
    }

    #[test]
    fn test_zero_demand_is_a_no_op() {
        let mut view = NetworkView::default();
        view.sources.push((1, source(10.0, 5.0)));
        view.storages.push((2, storage(100.0, 100.0)));
        view.consumers.push((3, ConsumerState::new(3.0))); // not demanding

        let settlement = resolve(1.0, &view);
        assert!(settlement.discharge_peeks.is_empty());
        assert!(settlement.source_offers.is_empty());
        assert!(settlement.source_commits.is_empty());
        assert_eq!(settlement.total_granted(), 0.0);
    }

    #[test]
    fn test_no_supply_means_zero_grants() {
        let mut view = NetworkView::default();
        view.consumers.push((1, demanding_consumer(10.0)));
        let mut conduit = ConduitState::new(ConduitMode::Drain);
        conduit.update_pool(7, 0.0, 50.0);
        view.conduits.push((2, conduit));

        let settlement = resolve(1.0, &view);
        assert_eq!(settlement.total_available, 0.0);
        assert_eq!(settlement.total_granted(), 0.0);
    }

    #[test]
    fn test_conservation_and_peek_bounds() {
        let mut view = NetworkView::default();
        view.sources.push((1, source(4.0, 3.0)));
        view.sources.push((2, source(50.0, 2.0)));
        view.storages.push((3, storage(30.0, 100.0)));
        view.storages.push((4, storage(30.0, 40.0)));
        view.consumers.push((5, demanding_consumer(20.0)));
        view.consumers.push((6, demanding_consumer(14.0)));
        let mut conduit = ConduitState::new(ConduitMode::Drain);
        conduit.update_pool(7, 10.0, 60.0);
        view.conduits.push((7, conduit));

        let settlement = resolve(1.0, &view);

        // Conservation: granted never exceeds committed, committed never
        // exceeds what was peeked/offered.
        assert!(settlement.total_granted() <= settlement.total_committed() + 1e-4);
        for (id, committed) in &settlement.storage_commits {
            assert!(*committed <= amount_for(&settlement.discharge_peeks, *id) + 1e-4);
        }
        for (id, committed) in &settlement.source_commits {
            assert!(*committed <= amount_for(&settlement.source_offers, *id) + 1e-4);
        }

        apply(&mut view, &settlement);
        for (_, s) in &view.sources {
            assert!(s.fuel >= 0.0);
        }
        for (_, s) in &view.storages {
            assert!(s.energy >= 0.0 && s.energy <= s.energy_capacity);
        }
    }

    #[test]
    fn test_refill_draws_down_a_shared_pool() {
        // One source with plenty of fuel, two empty storages. The first
        // storage in order must not absorb energy the pool no longer holds.
        let mut view = NetworkView::default();
        view.sources.push((1, source(1000.0, 30.0)));
        view.storages.push((2, storage(0.0, 100.0)));
        view.storages.push((3, storage(0.0, 100.0)));
        view.consumers.push((4, demanding_consumer(10.0)));

        let settlement = resolve(1.0, &view);
        // 30 produced, 10 to the consumer, 20 left to refill.
        let refilled: f32 = settlement.storage_refills.iter().map(|(_, a)| a).sum();
        assert!((refilled - 20.0).abs() < 1e-4);
        assert!(settlement.total_granted() <= settlement.total_committed() + 1e-4);
    }

    #[test]
    fn test_sources_charge_storages_without_consumers() {
        let mut view = NetworkView::default();
        view.sources.push((1, source(100.0, 5.0)));
        view.storages.push((2, storage(10.0, 100.0)));

        let settlement = resolve(1.0, &view);
        assert_eq!(amount_for(&settlement.storage_refills, 2), 5.0);
        assert_eq!(amount_for(&settlement.source_commits, 1), 5.0);

        apply(&mut view, &settlement);
        assert_eq!(view.storages[0].1.energy, 15.0);
        assert_eq!(view.sources[0].1.fuel, 95.0);
    }

    #[test]
    fn test_charge_conduit_demands_but_receives_nothing() {
        let mut view = NetworkView::default();
        view.sources.push((1, source(100.0, 50.0)));
        let mut conduit = ConduitState::new(ConduitMode::Charge);
        conduit.update_pool(7, 0.0, 40.0);
        view.conduits.push((2, conduit));

        let settlement = resolve(1.0, &view);
        assert_eq!(settlement.direct_demand, 40.0);
        assert!(settlement.pool_grants.is_empty());
    }

    #[test]
    fn test_shortfall_shared_pro_rata_across_consumers() {
        let mut view = NetworkView::default();
        view.sources.push((1, source(30.0, 30.0)));
        view.consumers.push((2, demanding_consumer(40.0)));
        view.consumers.push((3, demanding_consumer(20.0)));

        let settlement = resolve(1.0, &view);
        assert!((amount_for(&settlement.consumer_grants, 2) - 20.0).abs() < 1e-4);
        assert!((amount_for(&settlement.consumer_grants, 3) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_single_pass_matches_scenarios() {
        // Scenario: source fuel 10 rate 5, consumer demand 3.
        let mut view = NetworkView::default();
        view.sources.push((1, source(10.0, 5.0)));
        view.consumers.push((2, demanding_consumer(3.0)));
        let summary = resolve_single_pass(1.0, &mut view);
        assert_eq!(amount_for(&summary.consumer_grants, 2), 3.0);
        assert_eq!(view.sources[0].1.fuel, 7.0);

        // Scenario: two storages, no sources, demand 60.
        let mut view = NetworkView::default();
        view.storages.push((1, storage(0.0, 100.0)));
        view.storages.push((2, storage(50.0, 100.0)));
        view.consumers.push((3, demanding_consumer(60.0)));
        let summary = resolve_single_pass(1.0, &mut view);
        assert_eq!(amount_for(&summary.consumer_grants, 3), 50.0);
        assert!(view.storages.iter().all(|(_, s)| s.energy >= 0.0));
    }

    #[test]
    fn test_single_pass_conserves() {
        let mut view = NetworkView::default();
        view.sources.push((1, source(8.0, 6.0)));
        view.storages.push((2, storage(12.0, 50.0)));
        view.consumers.push((3, demanding_consumer(25.0)));
        let mut conduit = ConduitState::new(ConduitMode::Drain);
        conduit.update_pool(9, 5.0, 30.0);
        view.conduits.push((4, conduit));

        let summary = resolve_single_pass(1.0, &mut view);
        let supplied = summary.supplied_by_sources + summary.supplied_by_storages;
        assert!(summary.total_granted() <= supplied + 1e-4);
    }
}
