//! Energy consumers.
//!
//! A consumer requests power each tick based on its base consumption and
//! an intensity level set by whoever operates it. A consumer that is not
//! demanding requests nothing and is invisible to settlement.

use serde::{Deserialize, Serialize};

/// How hard a consumer is being driven. Scales base consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntensityLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl IntensityLevel {
    /// Demand multiplier applied to base consumption.
    pub fn multiplier(&self) -> f32 {
        match self {
            IntensityLevel::Low => 1.0,
            IntensityLevel::Medium => 1.5,
            IntensityLevel::High => 2.0,
        }
    }

    /// Persisted integer form (the record stores an int field).
    pub fn as_i64(&self) -> i64 {
        match self {
            IntensityLevel::Low => 0,
            IntensityLevel::Medium => 1,
            IntensityLevel::High => 2,
        }
    }

    /// Parse the persisted integer form. Unknown values fall back to Low
    /// rather than failing the load.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => IntensityLevel::Medium,
            2 => IntensityLevel::High,
            _ => IntensityLevel::Low,
        }
    }
}

/// State of one energy consumer (e.g. a powered machine).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Energy drawn per unit of tick time at Low intensity.
    pub base_power_consumption: f32,
    /// Current intensity level.
    pub intensity: IntensityLevel,
    /// Whether the consumer currently wants power.
    pub is_demanding: bool,
}

impl ConsumerState {
    pub fn new(base_power_consumption: f32) -> Self {
        Self {
            base_power_consumption,
            intensity: IntensityLevel::Low,
            is_demanding: false,
        }
    }

    /// Energy requested over a tick of `dt`. Zero when not demanding.
    pub fn requested_power(&self, dt: f32) -> f32 {
        if !self.is_demanding {
            return 0.0;
        }
        (self.base_power_consumption * self.intensity.multiplier() * dt).max(0.0)
    }
}
