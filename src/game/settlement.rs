//! Crash Settlement
//!
//! Every bet still riding at the crash is lost. Stakes were debited at
//! placement, so settling only records the outcome; no money moves.
//!
//! Each bet is written independently and concurrently. One failed or slow
//! write is logged and skipped; it never holds up the others or the next
//! round. Bets whose write failed stay `pending` in the repository until
//! the startup sweep settles them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::game::state::{ActiveBet, RoundId, UserId};
use crate::store::BetRepository;

/// Outcome of one settlement pass.
#[derive(Debug, Default)]
pub struct SettlementReport {
    /// Lost copies of every bet that was outstanding.
    pub settled: Vec<ActiveBet>,
    /// Users whose lost status could not be persisted, with the reason.
    pub failed: Vec<(UserId, String)>,
}

impl SettlementReport {
    /// Whether every write succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Marks outstanding bets lost through the bet repository.
#[derive(Clone)]
pub struct SettlementProcessor {
    bets: Arc<dyn BetRepository>,
    timeout: Duration,
}

impl SettlementProcessor {
    /// Create a processor with a per-write timeout.
    pub fn new(bets: Arc<dyn BetRepository>, timeout: Duration) -> Self {
        Self { bets, timeout }
    }

    /// Settle `outstanding` as lost.
    ///
    /// The returned `settled` list always covers every input bet, whether
    /// or not its write succeeded.
    pub async fn settle(&self, round_id: Option<RoundId>, outstanding: Vec<ActiveBet>) -> SettlementReport {
        let lost: Vec<ActiveBet> = outstanding.iter().map(ActiveBet::lost).collect();

        let writes = lost.iter().map(|bet| async move {
            match timeout(self.timeout, self.bets.update(bet)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((bet.user_id, e.to_string())),
                Err(_) => Some((bet.user_id, format!("timed out after {:?}", self.timeout))),
            }
        });
        let failed: Vec<(UserId, String)> = join_all(writes).await.into_iter().flatten().collect();

        for (user_id, reason) in &failed {
            warn!("Failed to settle bet for user {} in round {:?}: {}", user_id, round_id, reason);
        }
        debug!(
            "Settled {} bets as lost in round {:?} ({} write failures)",
            lost.len(),
            round_id,
            failed.len()
        );

        SettlementReport { settled: lost, failed }
    }
}
