//! Multiplier Clock
//!
//! Linear growth from the moment a round starts running:
//! `multiplier = 1 + elapsed_seconds * growth`, rounded to hundredths.
//! Growth is in basis points per second (500 == +0.05x per second).
//!
//! Time is passed in, never read, so tests drive it directly.

use std::time::Duration;

use tokio::time::Instant;

use crate::core::money::Multiplier;

/// Basis points in 1.00x.
const BASIS_POINTS_ONE: u128 = 10_000;

/// Multiplier after `elapsed` of running at `growth_bp` per second.
pub fn multiplier_after(elapsed: Duration, growth_bp: u32) -> Multiplier {
    let grown = elapsed.as_millis() * growth_bp as u128 / 1000;
    let basis_points = BASIS_POINTS_ONE + grown;
    let hundredths = (basis_points + 50) / 100;
    Multiplier::from_hundredths(hundredths.min(u32::MAX as u128) as u32)
}

/// Tracks the live multiplier for one running round.
#[derive(Debug, Clone)]
pub struct MultiplierClock {
    started_at: Instant,
    growth_bp: u32,
    last: Multiplier,
}

impl MultiplierClock {
    /// Start the clock at 1.00x.
    pub fn start(started_at: Instant, growth_bp: u32) -> Self {
        Self {
            started_at,
            growth_bp,
            last: Multiplier::ONE,
        }
    }

    /// When the round started running.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Last observed multiplier.
    pub fn current(&self) -> Multiplier {
        self.last
    }

    /// Observe the multiplier at `now`. Never decreases.
    pub fn observe(&mut self, now: Instant) -> Multiplier {
        let elapsed = now.saturating_duration_since(self.started_at);
        let value = multiplier_after(elapsed, self.growth_bp);
        if value > self.last {
            self.last = value;
        }
        self.last
    }
}
