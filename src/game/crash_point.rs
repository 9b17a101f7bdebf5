//! Crash Point Generation
//!
//! Maps a round seed to the multiplier the round will crash at:
//!
//! ```text
//! r     = u32(seed[0..4]) / 2^32               uniform in [0, 1)
//! crash = clamp(min, max, 1 / (1 - 0.9 r))     rounded to hundredths
//! ```
//!
//! Heavy-tailed: most rounds end close to 1.00x, few reach the 10.00x cap.
//! Integer math only, so a verifier in any language reproduces it exactly.

use serde::{Deserialize, Serialize};

use crate::core::money::Multiplier;
use crate::core::rng::{draw_from_seed, RoundSeed, SeedSource};
use crate::game::state::RoundId;
use crate::proof::commitment::FairnessCommitment;

/// 2^32 as the draw denominator.
const DRAW_SCALE: u128 = 1 << 32;

/// Inclusive crash point range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashBounds {
    /// Lowest crash point.
    pub min: Multiplier,
    /// Highest crash point.
    pub max: Multiplier,
}

impl Default for CrashBounds {
    fn default() -> Self {
        Self {
            min: Multiplier::ONE,
            max: Multiplier::from_hundredths(1000),
        }
    }
}

impl CrashBounds {
    /// Clamp a multiplier into range.
    pub fn clamp(self, value: Multiplier) -> Multiplier {
        value.max(self.min).min(self.max)
    }
}

/// Crash point for the uniform draw `draw / 2^32`.
pub fn crash_point_from_draw(draw: u32, bounds: CrashBounds) -> Multiplier {
    // 100 / (1 - 0.9 * n / 2^32) == 1000 * 2^32 / (10 * 2^32 - 9n)
    let numerator = 1000 * DRAW_SCALE;
    let denominator = 10 * DRAW_SCALE - 9 * draw as u128;
    let hundredths = (2 * numerator + denominator) / (2 * denominator);
    bounds.clamp(Multiplier::from_hundredths(hundredths.min(u32::MAX as u128) as u32))
}

/// Crash point a seed commits the round to.
pub fn crash_point_from_seed(seed: &RoundSeed, bounds: CrashBounds) -> Multiplier {
    crash_point_from_draw(draw_from_seed(seed), bounds)
}

/// Everything decided about a round at creation.
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    /// Seed (secret until crash).
    pub seed: RoundSeed,
    /// Crash point derived from the seed.
    pub crash_point: Multiplier,
    /// Commitment to the seed (public at countdown).
    pub commitment: FairnessCommitment,
}

/// Draws seeds and turns them into round outcomes.
pub struct CrashPointGenerator {
    source: Box<dyn SeedSource>,
    bounds: CrashBounds,
}

impl CrashPointGenerator {
    /// Create a generator over a seed source.
    pub fn new(source: Box<dyn SeedSource>, bounds: CrashBounds) -> Self {
        Self { source, bounds }
    }

    /// Bounds in effect.
    pub fn bounds(&self) -> CrashBounds {
        self.bounds
    }

    /// Decide the outcome for `round_id`.
    pub fn generate(&mut self, round_id: RoundId) -> RoundOutcome {
        let seed = self.source.next_seed();
        RoundOutcome {
            seed,
            crash_point: crash_point_from_seed(&seed, self.bounds),
            commitment: FairnessCommitment::new(round_id, &seed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::SequenceSeedSource;
    use proptest::prelude::*;
    use uuid::Uuid;

    #[test]
    fn test_zero_draw_crashes_at_one() {
        assert_eq!(crash_point_from_draw(0, CrashBounds::default()), Multiplier::ONE);
    }

    #[test]
    fn test_top_draw_clamps_to_ten() {
        assert_eq!(
            crash_point_from_draw(u32::MAX, CrashBounds::default()),
            Multiplier::from_hundredths(1000)
        );
    }

    #[test]
    fn test_known_draws() {
        let bounds = CrashBounds::default();
        // r = 0.5 -> 1 / 0.55 = 1.8181..
        assert_eq!(crash_point_from_draw(1 << 31, bounds), Multiplier::from_hundredths(182));
        assert_eq!(crash_point_from_draw(0x2f68_4bda, bounds), Multiplier::from_hundredths(120));
        assert_eq!(crash_point_from_draw(0x8ddd_a378, bounds), Multiplier::from_hundredths(200));
    }

    #[test]
    fn test_custom_bounds() {
        let bounds = CrashBounds {
            min: Multiplier::from_hundredths(110),
            max: Multiplier::from_hundredths(150),
        };
        assert_eq!(crash_point_from_draw(0, bounds), Multiplier::from_hundredths(110));
        assert_eq!(crash_point_from_draw(u32::MAX, bounds), Multiplier::from_hundredths(150));
    }

    #[test]
    fn test_generate_binds_commitment_to_seed() {
        let mut generator = CrashPointGenerator::new(
            Box::new(SequenceSeedSource::from_draws(&[0x2f68_4bda])),
            CrashBounds::default(),
        );
        let round_id = Uuid::new_v4();
        let outcome = generator.generate(round_id);

        assert_eq!(outcome.crash_point, Multiplier::from_hundredths(120));
        assert_eq!(outcome.commitment.round_id, round_id);
        assert!(outcome.commitment.opens_with(&outcome.seed));
    }

    proptest! {
        #[test]
        fn prop_crash_point_in_bounds(draw in any::<u32>()) {
            let point = crash_point_from_draw(draw, CrashBounds::default());
            prop_assert!(point >= Multiplier::ONE);
            prop_assert!(point <= Multiplier::from_hundredths(1000));
        }

        #[test]
        fn prop_crash_point_monotonic_in_draw(a in any::<u32>(), b in any::<u32>()) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let bounds = CrashBounds::default();
            prop_assert!(crash_point_from_draw(lo, bounds) <= crash_point_from_draw(hi, bounds));
        }
    }
}
