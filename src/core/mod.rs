//! Core primitives.
//!
//! Integer money arithmetic and the seed sources every round is built from.

pub mod money;
pub mod rng;

// Re-export core types
pub use money::{Amount, Multiplier};
pub use rng::{OsSeedSource, RoundSeed, SeedSource, SequenceSeedSource};
