//! Round and Bet State
//!
//! The records the engine owns: the live round, the bets placed on it and
//! the single `EngineState` value that ties them together.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::money::{Amount, Multiplier};
use crate::core::rng::RoundSeed;
use crate::game::ledger::BetLedger;

/// Round identifier.
pub type RoundId = Uuid;

/// Bet identifier.
pub type BetId = Uuid;

/// Authenticated user identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user acting on the engine: id plus the display name peers see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bettor {
    /// User identifier.
    pub id: UserId,
    /// Display name shown in peer events.
    pub name: String,
}

impl Bettor {
    /// Create a bettor.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self { id: UserId(id), name: name.into() }
    }
}

/// Round lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// No live round.
    Waiting,
    /// Betting window before the round runs.
    Countdown,
    /// Multiplier is growing; cash-outs accepted.
    Running,
    /// Round is over; cooling down before the next one.
    Crashed,
}

impl RoundPhase {
    /// Whether a round is live in this phase.
    pub fn is_live(self) -> bool {
        !matches!(self, RoundPhase::Waiting)
    }
}

/// A betting round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    /// Round identifier.
    pub id: RoundId,
    /// Target multiplier, fixed at creation.
    pub crash_point: Multiplier,
    /// Seed the crash point was derived from. Revealed only after the crash.
    pub seed: RoundSeed,
    /// Hex commitment to the seed, published at countdown start.
    pub fairness_hash: String,
    /// When the round was created (countdown start).
    pub started_at: DateTime<Utc>,
    /// When the round crashed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Phase the round is in.
    pub phase: RoundPhase,
}

impl Round {
    /// Whether the round has crashed.
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// The seed, once it is safe to publish.
    pub fn revealed_seed(&self) -> Option<RoundSeed> {
        self.is_ended().then_some(self.seed)
    }

    /// The crash point, once it is safe to publish.
    pub fn revealed_crash_point(&self) -> Option<Multiplier> {
        self.is_ended().then_some(self.crash_point)
    }
}

/// Bet status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Placed, not yet resolved.
    Pending,
    /// Cashed out before the crash.
    Won,
    /// Still riding at the crash.
    Lost,
}

/// A bet on the live round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveBet {
    /// Bet identifier.
    pub id: BetId,
    /// Owner.
    pub user_id: UserId,
    /// Owner's display name.
    pub username: String,
    /// Round the bet was placed on.
    pub round_id: RoundId,
    /// Amount wagered (always positive).
    pub stake: Amount,
    /// Resolution status.
    pub status: BetStatus,
    /// Multiplier locked in at cash-out.
    pub cash_out_multiplier: Option<Multiplier>,
    /// Payout credited (zero unless won).
    pub won_amount: Amount,
    /// When the bet was placed.
    pub placed_at: DateTime<Utc>,
}

impl ActiveBet {
    /// Create a pending bet.
    pub fn new(bettor: &Bettor, round_id: RoundId, stake: Amount) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: bettor.id,
            username: bettor.name.clone(),
            round_id,
            stake,
            status: BetStatus::Pending,
            cash_out_multiplier: None,
            won_amount: Amount::ZERO,
            placed_at: Utc::now(),
        }
    }

    /// Whether the bet is unresolved.
    pub fn is_pending(&self) -> bool {
        self.status == BetStatus::Pending
    }

    /// Copy of this bet resolved as won at `multiplier`.
    pub fn won(&self, multiplier: Multiplier, amount: Amount) -> Self {
        Self {
            status: BetStatus::Won,
            cash_out_multiplier: Some(multiplier),
            won_amount: amount,
            ..self.clone()
        }
    }

    /// Copy of this bet resolved as lost.
    pub fn lost(&self) -> Self {
        Self {
            status: BetStatus::Lost,
            cash_out_multiplier: None,
            won_amount: Amount::ZERO,
            ..self.clone()
        }
    }

    /// Winnings minus stake.
    pub fn profit(&self) -> Amount {
        self.won_amount.checked_sub(self.stake).unwrap_or(Amount::ZERO)
    }
}

/// Everything the engine knows about the live round.
///
/// Owned and mutated by the engine alone; everything else sees snapshots.
#[derive(Debug)]
pub struct EngineState {
    /// Current phase.
    pub phase: RoundPhase,
    /// Live multiplier (1.00 outside `Running`/`Crashed`).
    pub current_multiplier: Multiplier,
    /// The live round.
    pub round: Option<Round>,
    /// Bets on the live round.
    pub ledger: BetLedger,
}

impl EngineState {
    /// Initial waiting state.
    pub fn new() -> Self {
        Self {
            phase: RoundPhase::Waiting,
            current_multiplier: Multiplier::ONE,
            round: None,
            ledger: BetLedger::new(),
        }
    }

    /// Live round id, if any.
    pub fn round_id(&self) -> Option<RoundId> {
        self.round.as_ref().map(|r| r.id)
    }

    /// Drop the live round and every bet on it.
    pub fn clear(&mut self) {
        self.phase = RoundPhase::Waiting;
        self.round = None;
        self.ledger.clear();
    }

    /// Check the structural invariants that must hold between commands.
    pub fn invariants_hold(&self) -> bool {
        let multiplier_ok = self.current_multiplier >= Multiplier::ONE;
        let bets_scoped = match &self.round {
            Some(round) => self.ledger.bets().all(|b| b.round_id == round.id),
            None => self.ledger.is_empty(),
        };
        let live_round = self.phase.is_live() == self.round.is_some();
        multiplier_ok && bets_scoped && live_round && self.ledger.cashed_out_subset_of_bets()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bet_resolution_copies() {
        let bettor = Bettor::new(7, "alice");
        let bet = ActiveBet::new(&bettor, Uuid::new_v4(), Amount::from_units(100));
        assert!(bet.is_pending());
        assert_eq!(bet.won_amount, Amount::ZERO);

        let won = bet.won(Multiplier::from_hundredths(115), Amount::from_units(115));
        assert_eq!(won.status, BetStatus::Won);
        assert_eq!(won.id, bet.id);
        assert_eq!(won.profit(), Amount::from_units(15));

        let lost = bet.lost();
        assert_eq!(lost.status, BetStatus::Lost);
        assert_eq!(lost.won_amount, Amount::ZERO);
        assert!(lost.cash_out_multiplier.is_none());
    }

    #[test]
    fn test_round_reveals_only_after_end() {
        let mut round = Round {
            id: Uuid::new_v4(),
            crash_point: Multiplier::from_hundredths(250),
            seed: [9; 32],
            fairness_hash: String::new(),
            started_at: Utc::now(),
            ended_at: None,
            phase: RoundPhase::Countdown,
        };
        assert!(round.revealed_seed().is_none());
        assert!(round.revealed_crash_point().is_none());

        round.ended_at = Some(Utc::now());
        assert_eq!(round.revealed_seed(), Some([9; 32]));
        assert_eq!(round.revealed_crash_point(), Some(Multiplier::from_hundredths(250)));
    }

    #[test]
    fn test_fresh_state_holds_invariants() {
        let state = EngineState::new();
        assert_eq!(state.phase, RoundPhase::Waiting);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&RoundPhase::Countdown).unwrap();
        assert_eq!(json, "\"countdown\"");
    }
}
