//! Shutdown Snapshot
//!
//! On graceful shutdown the engine writes the live round and its bets to
//! disk (bincode). The next start loads the file, settles the round and
//! deletes it, so a snapshot is never applied twice.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::game::state::{ActiveBet, Round};

/// Snapshot file errors.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Filesystem failure.
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),

    /// File contents could not be encoded or decoded.
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Unsettled round captured at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    /// The interrupted round.
    pub round: Round,
    /// Every bet placed on it, including cashed-out ones.
    pub bets: Vec<ActiveBet>,
}

impl RecoverySnapshot {
    /// Encode to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Write to `path`, replacing any previous snapshot.
    pub async fn save(&self, path: &Path) -> Result<(), RecoveryError> {
        let bytes = self.to_bytes()?;
        let staging = staging_path(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        info!("Saved snapshot of round {} ({} bets) to {}", self.round.id, self.bets.len(), path.display());
        Ok(())
    }

    /// Read the snapshot at `path`, if any.
    pub async fn load(path: &Path) -> Result<Option<Self>, RecoveryError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(Self::from_bytes(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and delete the snapshot at `path`.
    pub async fn take(path: &Path) -> Result<Option<Self>, RecoveryError> {
        let snapshot = Self::load(path).await?;
        if snapshot.is_some() {
            tokio::fs::remove_file(path).await?;
            debug!("Consumed snapshot {}", path.display());
        }
        Ok(snapshot)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::{Amount, Multiplier};
    use crate::game::state::{Bettor, RoundPhase};
    use chrono::Utc;
    use uuid::Uuid;

    fn snapshot() -> RecoverySnapshot {
        let round = Round {
            id: Uuid::new_v4(),
            crash_point: Multiplier::from_hundredths(347),
            seed: [7; 32],
            fairness_hash: "ab".repeat(32),
            started_at: Utc::now(),
            ended_at: None,
            phase: RoundPhase::Running,
        };
        let pending = ActiveBet::new(&Bettor::new(1, "alice"), round.id, Amount::from_cents(1234));
        let won = ActiveBet::new(&Bettor::new(2, "bob"), round.id, Amount::from_units(10))
            .won(Multiplier::from_hundredths(150), Amount::from_units(15));
        RecoverySnapshot { round, bets: vec![pending, won] }
    }

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("crash-round-{}", Uuid::new_v4()))
            .join("snapshot.bin")
    }

    #[test]
    fn test_bytes_preserve_money_and_seed() {
        let original = snapshot();
        let decoded = RecoverySnapshot::from_bytes(&original.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.round.id, original.round.id);
        assert_eq!(decoded.round.seed, [7; 32]);
        assert_eq!(decoded.round.crash_point, Multiplier::from_hundredths(347));
        assert_eq!(decoded.bets[0].stake, Amount::from_cents(1234));
        assert_eq!(decoded.bets[1].won_amount, Amount::from_units(15));
        assert!(decoded.bets[0].is_pending());
    }

    #[tokio::test]
    async fn test_save_then_take_consumes_file() {
        let path = scratch_path();
        let original = snapshot();
        original.save(&path).await.unwrap();

        let taken = RecoverySnapshot::take(&path).await.unwrap().unwrap();
        assert_eq!(taken.round.id, original.round.id);
        assert!(!path.exists());
        assert!(RecoverySnapshot::take(&path).await.unwrap().is_none());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        assert!(RecoverySnapshot::load(&scratch_path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let path = scratch_path();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"\x01\x02").await.unwrap();

        assert!(matches!(
            RecoverySnapshot::load(&path).await,
            Err(RecoveryError::Encoding(_))
        ));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
