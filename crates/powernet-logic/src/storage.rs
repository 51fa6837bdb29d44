//! Energy storages.
//!
//! Storages participate on both sides of a settlement: they discharge
//! toward unmet demand (peek, then commit) and soak up leftover source
//! energy up to capacity. Energy never goes negative and never exceeds
//! capacity.

use serde::{Deserialize, Serialize};

/// State of one energy storage (e.g. a battery bank).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    /// Stored energy.
    pub energy: f32,
    /// Maximum energy the storage can hold.
    pub energy_capacity: f32,
}

impl StorageState {
    pub fn new(energy_capacity: f32) -> Self {
        Self {
            energy: 0.0,
            energy_capacity,
        }
    }

    /// Peek phase: how much this storage could discharge toward
    /// `remaining_demand` without mutating state.
    pub fn peek_discharge(&self, remaining_demand: f32) -> f32 {
        if remaining_demand <= 0.0 {
            return 0.0;
        }
        self.energy.min(remaining_demand).max(0.0)
    }

    /// Commit phase: actually subtract a discharge that was peeked
    /// earlier this tick. Returns the energy actually released.
    pub fn commit_discharge(&mut self, amount: f32) -> f32 {
        if amount <= 0.0 {
            return 0.0;
        }
        let released = amount.min(self.energy);
        self.energy = (self.energy - released).max(0.0);
        released
    }

    /// How much energy this storage wants to reach capacity.
    pub fn refill_request(&self) -> f32 {
        (self.energy_capacity - self.energy).max(0.0)
    }

    /// Accept refill energy, capped at capacity. Returns the amount
    /// actually absorbed.
    pub fn refill(&mut self, amount: f32) -> f32 {
        if amount <= 0.0 {
            return 0.0;
        }
        let absorbed = amount.min(self.refill_request());
        self.energy += absorbed;
        absorbed
    }
}
