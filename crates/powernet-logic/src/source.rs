//! Fuel-burning energy sources.
//!
//! Sources follow the two-phase protocol: `offer` reports how much energy
//! the source could produce this tick without mutating anything, and
//! `commit` later burns fuel for the portion actually used. A commit never
//! exceeds the most recent offer because the settlement allocates from the
//! offer list.

use serde::{Deserialize, Serialize};

/// State of one energy source (e.g. a fuel generator).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    /// Fuel on hand. One unit of fuel yields one unit of energy.
    pub fuel: f32,
    /// Maximum fuel the source can hold.
    pub fuel_capacity: f32,
    /// Maximum energy produced per unit of tick time.
    pub output_rate: f32,
    /// Whether the source is switched on.
    pub is_running: bool,
}

impl SourceState {
    pub fn new(fuel_capacity: f32, output_rate: f32) -> Self {
        Self {
            fuel: 0.0,
            fuel_capacity,
            output_rate,
            is_running: true,
        }
    }

    /// Peek phase: how much energy this source offers toward
    /// `remaining_demand` over a tick of `dt`, given whether the network
    /// is demanding at all. Does not mutate state.
    ///
    /// The offer is bounded by the output rate, the remaining demand, and
    /// the fuel on hand, so a source never offers more than it could burn.
    pub fn offer(&self, remaining_demand: f32, network_demanding: bool, dt: f32) -> f32 {
        if !self.is_running || !network_demanding || remaining_demand <= 0.0 {
            return 0.0;
        }
        (self.output_rate * dt).min(remaining_demand).min(self.fuel).max(0.0)
    }

    /// Commit phase: burn fuel for `amount` of produced energy. Returns the
    /// fuel actually burned, capped at what is on hand. Fuel never goes
    /// negative.
    pub fn commit(&mut self, amount: f32) -> f32 {
        if amount <= 0.0 {
            return 0.0;
        }
        let burned = amount.min(self.fuel);
        self.fuel = (self.fuel - burned).max(0.0);
        burned
    }

    /// Add fuel (e.g. a refuel RPC). Returns the amount actually accepted,
    /// capped at capacity.
    pub fn add_fuel(&mut self, amount: f32) -> f32 {
        if amount <= 0.0 {
            return 0.0;
        }
        let space = (self.fuel_capacity - self.fuel).max(0.0);
        let accepted = amount.min(space);
        self.fuel += accepted;
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(fuel: f32, rate: f32) -> SourceState {
        let mut s = SourceState::new(100.0, rate);
        s.fuel = fuel;
        s
    }

    #[test]
    fn test_offer_bounded_by_demand() {
        let s = source(10.0, 5.0);
        // Demand below the rate: offer exactly the demand, not the rate.
        assert_eq!(s.offer(3.0, true, 1.0), 3.0);
    }

    #[test]
    fn test_offer_bounded_by_rate_and_fuel() {
        let s = source(2.0, 5.0);
        assert_eq!(s.offer(100.0, true, 1.0), 2.0); // fuel-limited
        let s = source(50.0, 5.0);
        assert_eq!(s.offer(100.0, true, 2.0), 10.0); // rate * dt
    }

    #[test]
    fn test_offer_zero_when_idle_or_off() {
        let mut s = source(10.0, 5.0);
        assert_eq!(s.offer(3.0, false, 1.0), 0.0);
        s.is_running = false;
        assert_eq!(s.offer(3.0, true, 1.0), 0.0);
    }

    #[test]
    fn test_commit_burns_exactly_the_committed_energy() {
        let mut s = source(10.0, 5.0);
        let offered = s.offer(3.0, true, 1.0);
        let burned = s.commit(offered);
        assert_eq!(burned, 3.0);
        assert_eq!(s.fuel, 7.0);
    }

    #[test]
    fn test_commit_never_drives_fuel_negative() {
        let mut s = source(1.0, 5.0);
        let burned = s.commit(4.0);
        assert_eq!(burned, 1.0);
        assert_eq!(s.fuel, 0.0);
    }

    #[test]
    fn test_add_fuel_caps_at_capacity() {
        let mut s = source(95.0, 5.0);
        assert_eq!(s.add_fuel(10.0), 5.0);
        assert_eq!(s.fuel, 100.0);
        assert_eq!(s.add_fuel(1.0), 0.0);
    }
}
