//! Bet Ledger
//!
//! In-memory bets for the live round only. Enforces one bet per user and
//! a single cash-out per bet. Cleared whenever a new round starts.

use std::collections::{BTreeMap, BTreeSet};

use crate::game::engine::EngineError;
use crate::game::state::{ActiveBet, UserId};

/// Bets on the live round, keyed by user.
#[derive(Debug, Default)]
pub struct BetLedger {
    bets: BTreeMap<UserId, ActiveBet>,
    cashed_out: BTreeSet<UserId>,
}

impl BetLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a second bet from the same user.
    pub fn check_can_place(&self, user_id: UserId) -> Result<(), EngineError> {
        if self.bets.contains_key(&user_id) {
            return Err(EngineError::DuplicateBet);
        }
        Ok(())
    }

    /// Record a freshly placed bet.
    pub fn insert(&mut self, bet: ActiveBet) -> Result<(), EngineError> {
        self.check_can_place(bet.user_id)?;
        self.bets.insert(bet.user_id, bet);
        Ok(())
    }

    /// The bet `user_id` may cash out, or why it may not.
    pub fn check_can_cash_out(&self, user_id: UserId) -> Result<&ActiveBet, EngineError> {
        let bet = self.bets.get(&user_id).ok_or(EngineError::NoActiveBet)?;
        if self.cashed_out.contains(&user_id) {
            return Err(EngineError::AlreadyCashedOut);
        }
        Ok(bet)
    }

    /// Store the won copy of a bet and mark its owner as cashed out.
    pub fn record_cash_out(&mut self, won: ActiveBet) -> Result<(), EngineError> {
        self.check_can_cash_out(won.user_id)?;
        self.cashed_out.insert(won.user_id);
        self.bets.insert(won.user_id, won);
        Ok(())
    }

    /// Bets still riding (not cashed out).
    pub fn outstanding(&self) -> impl Iterator<Item = &ActiveBet> {
        self.bets
            .iter()
            .filter(|(user_id, _)| !self.cashed_out.contains(user_id))
            .map(|(_, bet)| bet)
    }

    /// Overwrite a bet with its settled copy.
    pub fn replace(&mut self, bet: ActiveBet) {
        if let Some(slot) = self.bets.get_mut(&bet.user_id) {
            *slot = bet;
        }
    }

    /// Look up a user's bet.
    pub fn get(&self, user_id: UserId) -> Option<&ActiveBet> {
        self.bets.get(&user_id)
    }

    /// All bets.
    pub fn bets(&self) -> impl Iterator<Item = &ActiveBet> {
        self.bets.values()
    }

    /// Whether `user_id` has a bet.
    pub fn has_bet(&self, user_id: UserId) -> bool {
        self.bets.contains_key(&user_id)
    }

    /// Whether `user_id` has cashed out.
    pub fn has_cashed_out(&self, user_id: UserId) -> bool {
        self.cashed_out.contains(&user_id)
    }

    /// Number of bets.
    pub fn len(&self) -> usize {
        self.bets.len()
    }

    /// No bets.
    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    /// Forget every bet and cash-out.
    pub fn clear(&mut self) {
        self.bets.clear();
        self.cashed_out.clear();
    }

    /// Every cashed-out user also has a bet.
    pub fn cashed_out_subset_of_bets(&self) -> bool {
        self.cashed_out.iter().all(|u| self.bets.contains_key(u))
    }
}
