//! Provably Fair Rounds
//!
//! Commit-reveal over the round seed:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  countdown   server publishes SHA256(domain ‖ round ‖ seed) │
//! │  crash       server publishes seed                          │
//! │  anyone      recomputes hash and crash point from the seed  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commitment;

// Re-export key types
pub use commitment::{CommitmentError, CommitmentHash, FairnessCommitment, FairnessReveal};
