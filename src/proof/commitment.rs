//! Round Fairness Commitment
//!
//! Commit to a round's seed before betting opens. Reveal the seed at the
//! crash so anyone can recompute both the commitment and the crash point.
//!
//! ```text
//! countdown:  publish  H = SHA256(DOMAIN ‖ round_id ‖ seed)
//! crash:      publish  seed
//! player:     check    SHA256(DOMAIN ‖ round_id ‖ seed) == H
//!             check    crash_point(seed) == announced crash point
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::money::Multiplier;
use crate::core::rng::RoundSeed;
use crate::game::crash_point::{crash_point_from_seed, CrashBounds};
use crate::game::state::RoundId;

/// Domain separator for commitments.
const COMMITMENT_DOMAIN: &[u8] = b"CRASH_ROUND_COMMIT_V1";

/// Commitment hash output (256 bits).
pub type CommitmentHash = [u8; 32];

/// Published before the round runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessCommitment {
    /// Round the commitment belongs to.
    pub round_id: RoundId,
    /// Commitment hash.
    pub hash: CommitmentHash,
}

impl FairnessCommitment {
    /// Commit to `seed` for `round_id`.
    pub fn new(round_id: RoundId, seed: &RoundSeed) -> Self {
        Self {
            round_id,
            hash: compute_commitment_hash(&round_id, seed),
        }
    }

    /// Parse a hex commitment as published in `round_state`.
    pub fn from_hex(round_id: RoundId, hex_hash: &str) -> Result<Self, CommitmentError> {
        let bytes = hex::decode(hex_hash).map_err(|_| CommitmentError::MalformedHash)?;
        let hash: CommitmentHash = bytes.try_into().map_err(|_| CommitmentError::MalformedHash)?;
        Ok(Self { round_id, hash })
    }

    /// Hex form of the hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Whether `seed` opens this commitment.
    pub fn opens_with(&self, seed: &RoundSeed) -> bool {
        compute_commitment_hash(&self.round_id, seed) == self.hash
    }
}

/// Compute commitment hash for a round seed.
fn compute_commitment_hash(round_id: &RoundId, seed: &RoundSeed) -> CommitmentHash {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(round_id.as_bytes());
    hasher.update(seed);
    hasher.finalize().into()
}

/// Published after the crash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FairnessReveal {
    /// Round identifier.
    pub round_id: RoundId,
    /// The seed the round was drawn from.
    pub seed: RoundSeed,
    /// The crash point the server announced.
    pub crash_point: Multiplier,
}

impl FairnessReveal {
    /// Verify the reveal against the commitment published earlier.
    pub fn verify(
        &self,
        commitment: &FairnessCommitment,
        bounds: CrashBounds,
    ) -> Result<(), CommitmentError> {
        if commitment.round_id != self.round_id || !commitment.opens_with(&self.seed) {
            return Err(CommitmentError::PreimageMismatch);
        }

        let expected = crash_point_from_seed(&self.seed, bounds);
        if expected != self.crash_point {
            return Err(CommitmentError::CrashPointMismatch {
                expected,
                got: self.crash_point,
            });
        }

        Ok(())
    }
}

/// Errors that can occur during commitment verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitmentError {
    /// Revealed seed does not open the commitment.
    PreimageMismatch,

    /// Announced crash point does not follow from the seed.
    CrashPointMismatch {
        /// Crash point derived from the seed.
        expected: Multiplier,
        /// Crash point the server announced.
        got: Multiplier,
    },

    /// Commitment is not 32 bytes of hex.
    MalformedHash,
}

impl std::fmt::Display for CommitmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreimageMismatch => write!(f, "Seed doesn't open the commitment"),
            Self::CrashPointMismatch { expected, got } => {
                write!(f, "Crash point mismatch: seed gives {}, announced {}", expected, got)
            }
            Self::MalformedHash => write!(f, "Commitment is not a 32-byte hex hash"),
        }
    }
}

impl std::error::Error for CommitmentError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::seed_with_draw;
    use uuid::Uuid;

    fn reveal_for(round_id: RoundId, seed: RoundSeed) -> FairnessReveal {
        FairnessReveal {
            round_id,
            seed,
            crash_point: crash_point_from_seed(&seed, CrashBounds::default()),
        }
    }

    #[test]
    fn test_commitment_determinism() {
        let round_id = Uuid::from_bytes([1; 16]);
        let a = FairnessCommitment::new(round_id, &[7; 32]);
        let b = FairnessCommitment::new(round_id, &[7; 32]);
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_commitment_binds_round() {
        let a = FairnessCommitment::new(Uuid::from_bytes([1; 16]), &[7; 32]);
        let b = FairnessCommitment::new(Uuid::from_bytes([2; 16]), &[7; 32]);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_reveal_verification() {
        let round_id = Uuid::new_v4();
        let seed = seed_with_draw(0x2f68_4bda);
        let commitment = FairnessCommitment::new(round_id, &seed);

        let reveal = reveal_for(round_id, seed);
        assert_eq!(reveal.crash_point, Multiplier::from_hundredths(120));
        assert!(reveal.verify(&commitment, CrashBounds::default()).is_ok());
    }

    #[test]
    fn test_wrong_seed_fails() {
        let round_id = Uuid::new_v4();
        let commitment = FairnessCommitment::new(round_id, &seed_with_draw(10));

        let reveal = reveal_for(round_id, seed_with_draw(11));
        assert_eq!(
            reveal.verify(&commitment, CrashBounds::default()),
            Err(CommitmentError::PreimageMismatch)
        );
    }

    #[test]
    fn test_altered_crash_point_fails() {
        let round_id = Uuid::new_v4();
        let seed = seed_with_draw(0x2f68_4bda);
        let commitment = FairnessCommitment::new(round_id, &seed);

        let mut reveal = reveal_for(round_id, seed);
        reveal.crash_point = Multiplier::from_hundredths(110);
        assert!(matches!(
            reveal.verify(&commitment, CrashBounds::default()),
            Err(CommitmentError::CrashPointMismatch { .. })
        ));
    }

    #[test]
    fn test_hex_round_trip() {
        let round_id = Uuid::new_v4();
        let commitment = FairnessCommitment::new(round_id, &[3; 32]);
        let parsed = FairnessCommitment::from_hex(round_id, &commitment.to_hex()).unwrap();
        assert_eq!(parsed, commitment);

        assert_eq!(
            FairnessCommitment::from_hex(round_id, "abcd"),
            Err(CommitmentError::MalformedHash)
        );
        assert_eq!(
            FairnessCommitment::from_hex(round_id, "not hex"),
            Err(CommitmentError::MalformedHash)
        );
    }
}
