//! Round Seed Sources
//!
//! Every round is driven by one 32-byte seed. The seed decides the crash
//! point and is hashed into the fairness commitment, so it is the only
//! piece of randomness a round consumes.
//!
//! Production draws seeds from the operating system CSPRNG. Tests inject a
//! fixed sequence so crash points and commitments are reproducible.

use rand::rngs::OsRng;
use rand::RngCore;

/// A round seed (kept secret until the round crashes).
pub type RoundSeed = [u8; 32];

/// Source of round seeds.
pub trait SeedSource: Send + Sync {
    /// Produce the seed for the next round.
    fn next_seed(&mut self) -> RoundSeed;
}

/// Seeds from the operating system's cryptographically secure generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSeedSource;

impl SeedSource for OsSeedSource {
    fn next_seed(&mut self) -> RoundSeed {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        seed
    }
}

/// Replays a fixed list of seeds, cycling when exhausted.
#[derive(Debug, Clone)]
pub struct SequenceSeedSource {
    seeds: Vec<RoundSeed>,
    next: usize,
}

impl SequenceSeedSource {
    /// Create from a list of seeds.
    pub fn new(seeds: Vec<RoundSeed>) -> Self {
        Self { seeds, next: 0 }
    }

    /// Create from uniform draws (see [`seed_with_draw`]).
    pub fn from_draws(draws: &[u32]) -> Self {
        Self::new(draws.iter().map(|d| seed_with_draw(*d)).collect())
    }
}

impl SeedSource for SequenceSeedSource {
    fn next_seed(&mut self) -> RoundSeed {
        if self.seeds.is_empty() {
            return [0; 32];
        }
        let seed = self.seeds[self.next % self.seeds.len()];
        self.next = self.next.wrapping_add(1);
        seed
    }
}

/// The uniform draw `n` encoded in a seed; `r = n / 2^32`.
#[inline]
pub fn draw_from_seed(seed: &RoundSeed) -> u32 {
    u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]])
}

/// Build a seed whose draw is exactly `draw`.
///
/// The remaining bytes are a fixed pattern so commitments differ per draw
/// but stay reproducible.
pub fn seed_with_draw(draw: u32) -> RoundSeed {
    let mut seed = [0xA5u8; 32];
    seed[..4].copy_from_slice(&draw.to_be_bytes());
    seed
}
