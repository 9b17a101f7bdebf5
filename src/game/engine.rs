//! Round Engine
//!
//! Owns the live round and is the only code that mutates it. Drives the
//! phase cycle and judges every bet and cash-out against one consistent
//! view of state.
//!
//! ```text
//!  waiting ──start_new_round──▶ countdown ──countdown hits 0──▶ running
//!     ▲                                                            │
//!     └────────── cooldown elapsed ◀── crashed ◀── multiplier ≥ crash point
//! ```
//!
//! The engine never sleeps. Callers pass `now` into every time-dependent
//! method and ask [`RoundEngine::next_wake`] when to call back; the runner
//! turns that into real timers and tests turn it into plain arithmetic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::money::{Amount, Multiplier};
use crate::game::clock::MultiplierClock;
use crate::game::config::EngineConfig;
use crate::game::crash_point::CrashPointGenerator;
use crate::game::events::{Broadcaster, EngineEvent, Outbound};
use crate::game::recovery::RecoverySnapshot;
use crate::game::settlement::{SettlementProcessor, SettlementReport};
use crate::game::state::{
    ActiveBet, BetId, Bettor, EngineState, Round, RoundId, RoundPhase, UserId,
};
use crate::store::{BetRepository, RoundRepository, StoreError, WalletError, WalletStore};

/// Countdown announcement period.
const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

/// Engine command errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Command not legal in the current phase.
    #[error("not allowed while round is {phase:?}")]
    InvalidPhase {
        /// Phase at the time of the command.
        phase: RoundPhase,
    },

    /// User already has a bet on this round.
    #[error("already have a bet in this round")]
    DuplicateBet,

    /// Wallet could not cover the stake.
    #[error("insufficient balance")]
    InsufficientBalance,

    /// User has no bet on this round.
    #[error("no active bet found")]
    NoActiveBet,

    /// User already cashed out this round.
    #[error("already cashed out")]
    AlreadyCashedOut,

    /// Stake outside the configured limits.
    #[error("stake must be between {min} and {max}")]
    InvalidStake {
        /// Smallest accepted stake.
        min: Amount,
        /// Largest accepted stake.
        max: Amount,
    },

    /// Wallet or repository failed.
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Engine task is gone.
    #[error("engine is not running")]
    EngineStopped,
}

/// Wallet or repository failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Wallet call failed.
    #[error("wallet: {0}")]
    Wallet(String),

    /// Repository call failed.
    #[error("repository: {0}")]
    Repository(String),

    /// Call did not finish within the collaborator timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl From<StoreError> for CollaboratorError {
    fn from(e: StoreError) -> Self {
        CollaboratorError::Repository(e.to_string())
    }
}

/// Accepted bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetReceipt {
    /// Bet identifier.
    pub bet_id: BetId,
    /// Stake.
    pub amount: Amount,
    /// Round the bet rides on.
    pub round_id: RoundId,
}

/// Successful cash-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashOutReceipt {
    /// Multiplier locked in.
    pub multiplier: Multiplier,
    /// Amount credited.
    pub win_amount: Amount,
    /// Wallet balance after the credit.
    pub balance: Amount,
}

/// Authoritative state as seen by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    /// Current phase.
    pub phase: RoundPhase,
    /// Live multiplier.
    pub multiplier: Multiplier,
    /// Live round.
    pub round_id: Option<RoundId>,
    /// Crash point (crashed phase only).
    pub crash_point: Option<Multiplier>,
    /// Seed commitment for the live round.
    pub fairness_hash: Option<String>,
    /// Whether the viewer has a bet on this round.
    pub has_bet: bool,
    /// Whether the viewer already cashed out.
    pub has_cashed_out: bool,
}

/// Past round as shown in the round list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    /// Round identifier.
    pub id: RoundId,
    /// Crash point (ended rounds only).
    pub crash_point: Option<Multiplier>,
    /// Seed commitment.
    pub fairness_hash: String,
    /// Hex seed (ended rounds only).
    pub seed: Option<String>,
    /// Countdown start.
    pub started_at: DateTime<Utc>,
    /// Crash time.
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Round> for RoundSummary {
    fn from(round: &Round) -> Self {
        Self {
            id: round.id,
            crash_point: round.revealed_crash_point(),
            fairness_hash: round.fairness_hash.clone(),
            seed: round.revealed_seed().map(hex::encode),
            started_at: round.started_at,
            ended_at: round.ended_at,
        }
    }
}

/// External services the engine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    /// Balances.
    pub wallet: Arc<dyn WalletStore>,
    /// Bet persistence.
    pub bets: Arc<dyn BetRepository>,
    /// Round persistence.
    pub rounds: Arc<dyn RoundRepository>,
    /// Event fan-out.
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Await a collaborator call for at most `limit`.
async fn bounded<F: Future>(limit: Duration, what: &'static str, fut: F) -> Result<F::Output, CollaboratorError> {
    timeout(limit, fut).await.map_err(|_| {
        warn!("{} exceeded {:?}", what, limit);
        CollaboratorError::Timeout(what)
    })
}

/// History lookups. Touch only the repositories, never live state.
#[derive(Clone)]
pub struct HistoryQuery {
    bets: Arc<dyn BetRepository>,
    rounds: Arc<dyn RoundRepository>,
    timeout: Duration,
}

impl HistoryQuery {
    /// A user's recent bets, newest first.
    pub async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<ActiveBet>, EngineError> {
        let bets = bounded(self.timeout, "bet history", self.bets.history(user_id, limit))
            .await?
            .map_err(CollaboratorError::from)?;
        Ok(bets)
    }

    /// Recent rounds, newest first. Crash points of unfinished rounds stay hidden.
    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundSummary>, EngineError> {
        let rounds = bounded(self.timeout, "recent rounds", self.rounds.recent(limit))
            .await?
            .map_err(CollaboratorError::from)?;
        Ok(rounds.iter().map(RoundSummary::from).collect())
    }
}

/// The round engine.
pub struct RoundEngine {
    config: EngineConfig,
    state: EngineState,
    generator: CrashPointGenerator,
    settlement: SettlementProcessor,
    collaborators: Collaborators,
    clock: Option<MultiplierClock>,
    countdown_remaining: u32,
    next_wake: Option<Instant>,
}

impl RoundEngine {
    /// Create an engine in the waiting phase.
    pub fn new(config: EngineConfig, generator: CrashPointGenerator, collaborators: Collaborators) -> Self {
        let config = config.validated();
        let settlement = SettlementProcessor::new(collaborators.bets.clone(), config.collaborator_timeout);
        Self {
            config,
            state: EngineState::new(),
            generator,
            settlement,
            collaborators,
            clock: None,
            countdown_remaining: 0,
            next_wake: None,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-only view of engine state.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.state.phase
    }

    /// When the engine next needs [`RoundEngine::on_timer`].
    pub fn next_wake(&self) -> Option<Instant> {
        self.next_wake
    }

    fn emit(&self, outbound: Outbound) {
        self.collaborators.broadcaster.publish(outbound);
    }

    fn set_phase(&mut self, phase: RoundPhase) {
        self.state.phase = phase;
        if let Some(round) = self.state.round.as_mut() {
            round.phase = phase;
        }
    }

    // =========================================================================
    // PHASE TRANSITIONS
    // =========================================================================

    /// Begin a new round: waiting → countdown.
    ///
    /// Returns `Ok(false)` without touching anything when not waiting. If the
    /// round record cannot be stored the engine stays waiting and schedules
    /// a retry after the configured backoff.
    pub async fn start_new_round(&mut self, now: Instant) -> Result<bool, EngineError> {
        if self.state.phase != RoundPhase::Waiting {
            return Ok(false);
        }

        let round_id = Uuid::new_v4();
        let outcome = self.generator.generate(round_id);
        let round = Round {
            id: round_id,
            crash_point: outcome.crash_point,
            seed: outcome.seed,
            fairness_hash: outcome.commitment.to_hex(),
            started_at: Utc::now(),
            ended_at: None,
            phase: RoundPhase::Countdown,
        };

        let stored = bounded(
            self.config.collaborator_timeout,
            "round create",
            self.collaborators.rounds.create(&round),
        )
        .await
        .and_then(|r| r.map_err(CollaboratorError::from));

        if let Err(e) = stored {
            error!("Failed to create round, retrying in {:?}: {}", self.config.round_retry_backoff, e);
            self.next_wake = Some(now + self.config.round_retry_backoff);
            return Err(e.into());
        }

        let fairness_hash = round.fairness_hash.clone();
        self.state.ledger.clear();
        self.state.current_multiplier = Multiplier::ONE;
        self.state.round = Some(round);
        self.set_phase(RoundPhase::Countdown);
        self.clock = None;
        self.countdown_remaining = self.config.countdown_seconds();
        self.next_wake = Some(now + COUNTDOWN_STEP);

        info!("Round {} counting down ({}s), commitment {}", round_id, self.countdown_remaining, fairness_hash);
        self.emit(Outbound::all(EngineEvent::RoundState {
            phase: RoundPhase::Countdown,
            round_id: Some(round_id),
            countdown: Some(self.countdown_remaining),
            fairness_hash: Some(fairness_hash),
        }));

        Ok(true)
    }

    /// Handle the timer the engine asked for via `next_wake`.
    pub async fn on_timer(&mut self, now: Instant) {
        match self.state.phase {
            RoundPhase::Waiting => {
                // Errors are logged and rescheduled inside
                let _ = self.start_new_round(now).await;
            }
            RoundPhase::Countdown => self.advance_countdown(now).await,
            RoundPhase::Running => self.tick(now).await,
            RoundPhase::Crashed => self.finish_cooldown(now).await,
        }
    }

    async fn advance_countdown(&mut self, now: Instant) {
        self.countdown_remaining = self.countdown_remaining.saturating_sub(1);
        self.emit(Outbound::all(EngineEvent::CountdownTick {
            seconds_remaining: self.countdown_remaining,
        }));

        if self.countdown_remaining == 0 {
            self.begin_running(now).await;
        } else {
            self.next_wake = Some(now + COUNTDOWN_STEP);
        }
    }

    /// countdown → running.
    async fn begin_running(&mut self, now: Instant) {
        let Some(round_id) = self.state.round_id() else {
            warn!("Countdown finished without a round");
            self.state.clear();
            self.next_wake = Some(now);
            return;
        };

        self.set_phase(RoundPhase::Running);
        self.clock = Some(MultiplierClock::start(now, self.config.growth_rate_bp));

        info!("Round {} running with {} bets", round_id, self.state.ledger.len());
        self.emit(Outbound::all(EngineEvent::RoundState {
            phase: RoundPhase::Running,
            round_id: Some(round_id),
            countdown: None,
            fairness_hash: None,
        }));

        // A 1.00x round ends at its first observation
        if self.crash_due(Multiplier::ONE) {
            self.crash(now).await;
        } else {
            self.next_wake = Some(now + self.config.tick_interval);
        }
    }

    fn crash_due(&self, observed: Multiplier) -> bool {
        self.state
            .round
            .as_ref()
            .is_some_and(|round| observed >= round.crash_point)
    }

    /// One running-phase tick: publish the multiplier, then check the crash.
    async fn tick(&mut self, now: Instant) {
        let (Some(clock), Some(round)) = (self.clock.as_mut(), self.state.round.as_ref()) else {
            return;
        };
        let round_id = round.id;
        let crash_point = round.crash_point;

        let observed = clock.observe(now);
        let multiplier = if observed >= crash_point { crash_point } else { observed };
        self.state.current_multiplier = self.state.current_multiplier.max(multiplier);

        self.emit(Outbound::all(EngineEvent::MultiplierTick {
            multiplier: self.state.current_multiplier,
            round_id,
        }));

        if self.crash_due(observed) {
            self.crash(now).await;
        } else {
            self.next_wake = Some(now + self.config.tick_interval);
        }
    }

    /// running → crashed. Settles every outstanding bet.
    async fn crash(&mut self, now: Instant) {
        self.clock = None;
        self.set_phase(RoundPhase::Crashed);

        let Some(round) = self.state.round.as_mut() else {
            self.next_wake = Some(now + self.config.cooldown);
            return;
        };
        round.ended_at = Some(Utc::now());
        let round_snapshot = round.clone();

        let outstanding: Vec<ActiveBet> = self.state.ledger.outstanding().cloned().collect();
        let report = self.settlement.settle(Some(round_snapshot.id), outstanding).await;
        for bet in report.settled {
            self.state.ledger.replace(bet);
        }

        let updated = bounded(
            self.config.collaborator_timeout,
            "round update",
            self.collaborators.rounds.update(&round_snapshot),
        )
        .await
        .and_then(|r| r.map_err(CollaboratorError::from));
        if let Err(e) = updated {
            warn!("Failed to record end of round {}: {}", round_snapshot.id, e);
        }

        info!(
            "Round {} crashed at {} ({} bets, {} cashed out)",
            round_snapshot.id,
            round_snapshot.crash_point,
            self.state.ledger.len(),
            self.state.ledger.bets().filter(|b| b.cash_out_multiplier.is_some()).count()
        );
        self.emit(Outbound::all(EngineEvent::RoundCrashed {
            crash_point: round_snapshot.crash_point,
            round_id: round_snapshot.id,
            seed: hex::encode(round_snapshot.seed),
        }));

        self.next_wake = Some(now + self.config.cooldown);
    }

    /// crashed → waiting → countdown.
    async fn finish_cooldown(&mut self, now: Instant) {
        self.state.clear();
        self.next_wake = None;
        self.emit(Outbound::all(EngineEvent::RoundState {
            phase: RoundPhase::Waiting,
            round_id: None,
            countdown: None,
            fairness_hash: None,
        }));
        let _ = self.start_new_round(now).await;
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Stake `amount` on the live round. Countdown only.
    ///
    /// Debit and bet creation succeed or fail together: if the bet cannot be
    /// stored after the debit, the stake is credited back.
    pub async fn place_bet(&mut self, bettor: &Bettor, amount: Amount) -> Result<BetReceipt, EngineError> {
        let phase = self.state.phase;
        if phase != RoundPhase::Countdown {
            return Err(EngineError::InvalidPhase { phase });
        }
        if amount < self.config.min_bet || amount > self.config.max_bet {
            return Err(EngineError::InvalidStake {
                min: self.config.min_bet,
                max: self.config.max_bet,
            });
        }
        self.state.ledger.check_can_place(bettor.id)?;
        let round_id = self.state.round_id().ok_or(EngineError::InvalidPhase { phase })?;

        let limit = self.config.collaborator_timeout;
        match bounded(limit, "wallet debit", self.collaborators.wallet.debit(bettor.id, amount)).await? {
            Ok(_) => {}
            Err(WalletError::InsufficientBalance { .. }) => return Err(EngineError::InsufficientBalance),
            Err(e) => return Err(CollaboratorError::Wallet(e.to_string()).into()),
        }

        let bet = ActiveBet::new(bettor, round_id, amount);
        let created = bounded(limit, "bet create", self.collaborators.bets.create(&bet))
            .await
            .and_then(|r| r.map_err(CollaboratorError::from));
        if let Err(e) = created {
            warn!("Bet for user {} not stored, refunding {}: {}", bettor.id, amount, e);
            self.refund(bettor.id, amount).await;
            return Err(e.into());
        }

        self.state.ledger.insert(bet.clone())?;
        debug!("User {} bet {} on round {}", bettor.id, amount, round_id);

        self.emit(Outbound::to_user(
            bettor.id,
            EngineEvent::BetAccepted { bet_id: bet.id, amount, round_id },
        ));
        self.emit(Outbound::all(EngineEvent::PeerBet {
            username: bettor.name.clone(),
            amount,
        }));

        Ok(BetReceipt { bet_id: bet.id, amount, round_id })
    }

    async fn refund(&self, user_id: UserId, amount: Amount) {
        let refunded = bounded(
            self.config.collaborator_timeout,
            "wallet refund",
            self.collaborators.wallet.credit(user_id, amount),
        )
        .await;
        match refunded {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Refund of {} to user {} failed: {}", amount, user_id, e),
            Err(e) => error!("Refund of {} to user {} failed: {}", amount, user_id, e),
        }
    }

    /// Lock in the current multiplier for `user_id`. Running only.
    pub async fn cash_out(&mut self, user_id: UserId) -> Result<CashOutReceipt, EngineError> {
        let phase = self.state.phase;
        if phase != RoundPhase::Running {
            return Err(EngineError::InvalidPhase { phase });
        }
        let bet = self.state.ledger.check_can_cash_out(user_id)?.clone();

        let multiplier = self.state.current_multiplier;
        let win_amount = bet.stake.scaled_by(multiplier);
        let won = bet.won(multiplier, win_amount);

        let limit = self.config.collaborator_timeout;
        let balance = match bounded(limit, "wallet credit", self.collaborators.wallet.credit(user_id, win_amount)).await? {
            Ok(balance) => balance,
            Err(e) => return Err(CollaboratorError::Wallet(e.to_string()).into()),
        };

        let updated = bounded(limit, "bet update", self.collaborators.bets.update(&won))
            .await
            .and_then(|r| r.map_err(CollaboratorError::from));
        if let Err(e) = updated {
            warn!("Cash-out for user {} not stored, reversing credit: {}", user_id, e);
            let reversed = bounded(limit, "wallet reversal", self.collaborators.wallet.debit(user_id, win_amount)).await;
            if !matches!(reversed, Ok(Ok(_))) {
                // The credit stands, so the cash-out stands with it
                error!(
                    "Could not reverse credit of {} to user {}, keeping the cash-out",
                    win_amount, user_id
                );
                self.state.ledger.record_cash_out(won)?;
            }
            return Err(e.into());
        }

        let username = won.username.clone();
        self.state.ledger.record_cash_out(won)?;
        debug!("User {} cashed out at {} for {}", user_id, multiplier, win_amount);

        self.emit(Outbound::to_user(
            user_id,
            EngineEvent::CashOutResult { multiplier, win_amount, balance },
        ));
        self.emit(Outbound::all(EngineEvent::PeerCashOut {
            username,
            multiplier,
            win_amount,
        }));

        Ok(CashOutReceipt { multiplier, win_amount, balance })
    }

    /// Authoritative state for `viewer` (anonymous when `None`).
    pub fn get_state(&self, viewer: Option<UserId>) -> StateView {
        let round = self.state.round.as_ref();
        StateView {
            phase: self.state.phase,
            multiplier: self.state.current_multiplier,
            round_id: round.map(|r| r.id),
            crash_point: round
                .filter(|_| self.state.phase == RoundPhase::Crashed)
                .map(|r| r.crash_point),
            fairness_hash: round.map(|r| r.fairness_hash.clone()),
            has_bet: viewer.is_some_and(|u| self.state.ledger.has_bet(u)),
            has_cashed_out: viewer.is_some_and(|u| self.state.ledger.has_cashed_out(u)),
        }
    }

    /// Read-only queries that can run off the engine task.
    pub fn queries(&self) -> HistoryQuery {
        HistoryQuery {
            bets: self.collaborators.bets.clone(),
            rounds: self.collaborators.rounds.clone(),
            timeout: self.config.collaborator_timeout,
        }
    }

    /// A user's recent bets, newest first.
    pub async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<ActiveBet>, EngineError> {
        self.queries().history(user_id, limit).await
    }

    /// Recent rounds, newest first.
    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundSummary>, EngineError> {
        self.queries().recent_rounds(limit).await
    }

    // =========================================================================
    // SHUTDOWN AND RECOVERY
    // =========================================================================

    /// What a restart needs to settle the live round, if one is unsettled.
    pub fn snapshot(&self) -> Option<RecoverySnapshot> {
        match self.state.phase {
            RoundPhase::Countdown | RoundPhase::Running => {
                let round = self.state.round.clone()?;
                Some(RecoverySnapshot {
                    round,
                    bets: self.state.ledger.bets().cloned().collect(),
                })
            }
            RoundPhase::Waiting | RoundPhase::Crashed => None,
        }
    }

    /// Settle a round interrupted by shutdown. Waiting phase only.
    pub async fn recover(&mut self, snapshot: RecoverySnapshot) -> Result<SettlementReport, EngineError> {
        let phase = self.state.phase;
        if phase != RoundPhase::Waiting {
            return Err(EngineError::InvalidPhase { phase });
        }

        let RecoverySnapshot { mut round, bets } = snapshot;
        let outstanding: Vec<ActiveBet> = bets.into_iter().filter(ActiveBet::is_pending).collect();
        let report = self.settlement.settle(Some(round.id), outstanding).await;

        self.close_round(&mut round).await;
        info!(
            "Recovered round {}: crash point {}, seed {}, {} bets settled",
            round.id,
            round.crash_point,
            hex::encode(round.seed),
            report.settled.len()
        );
        Ok(report)
    }

    /// Settle every bet the repository still lists as pending. Waiting phase only.
    pub async fn recover_pending(&mut self) -> Result<SettlementReport, EngineError> {
        let phase = self.state.phase;
        if phase != RoundPhase::Waiting {
            return Err(EngineError::InvalidPhase { phase });
        }

        let pending = bounded(
            self.config.collaborator_timeout,
            "pending bets",
            self.collaborators.bets.pending(),
        )
        .await?
        .map_err(CollaboratorError::from)?;

        let mut round_ids: Vec<RoundId> = pending.iter().map(|b| b.round_id).collect();
        round_ids.sort();
        round_ids.dedup();

        let report = self.settlement.settle(None, pending).await;

        for round_id in round_ids {
            let found = bounded(
                self.config.collaborator_timeout,
                "round lookup",
                self.collaborators.rounds.get(round_id),
            )
            .await;
            if let Ok(Ok(Some(mut round))) = found {
                self.close_round(&mut round).await;
            }
        }

        if !report.settled.is_empty() {
            info!("Settled {} stale pending bets", report.settled.len());
        }
        Ok(report)
    }

    async fn close_round(&self, round: &mut Round) {
        if round.is_ended() {
            return;
        }
        round.ended_at = Some(Utc::now());
        round.phase = RoundPhase::Crashed;
        let updated = bounded(
            self.config.collaborator_timeout,
            "round update",
            self.collaborators.rounds.update(round),
        )
        .await;
        if !matches!(updated, Ok(Ok(()))) {
            warn!("Could not close interrupted round {}", round.id);
        }
    }
}
