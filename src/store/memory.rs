//! In-memory collaborators for the standalone server and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::core::money::Amount;
use crate::game::state::{ActiveBet, BetId, BetStatus, Round, RoundId, UserId};
use crate::store::{BetRepository, RoundRepository, StoreError, WalletError, WalletStore};

/// Wallet held in process memory.
///
/// One mutex guards every balance, so check-and-debit is atomic per user.
#[derive(Debug, Default)]
pub struct InMemoryWallet {
    balances: Mutex<BTreeMap<UserId, Amount>>,
    opening_balance: Amount,
}

impl InMemoryWallet {
    /// Empty wallet; unknown users start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown users start with `opening_balance`.
    pub fn with_opening_balance(opening_balance: Amount) -> Self {
        Self {
            balances: Mutex::new(BTreeMap::new()),
            opening_balance,
        }
    }

    /// Add funds outside of a round (deposits).
    pub async fn deposit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError> {
        self.credit(user_id, amount).await
    }

    /// Overwrite a balance.
    pub async fn set_balance(&self, user_id: UserId, amount: Amount) {
        self.balances.lock().await.insert(user_id, amount);
    }
}

#[async_trait]
impl WalletStore for InMemoryWallet {
    async fn debit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError> {
        if !amount.is_positive() {
            return Err(WalletError::InvalidAmount(amount));
        }
        let mut balances = self.balances.lock().await;
        let balance = *balances.entry(user_id).or_insert(self.opening_balance);
        if balance < amount {
            return Err(WalletError::InsufficientBalance { balance, requested: amount });
        }
        let new_balance = balance
            .checked_sub(amount)
            .ok_or(WalletError::InvalidAmount(amount))?;
        balances.insert(user_id, new_balance);
        Ok(new_balance)
    }

    async fn credit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError> {
        if !amount.is_positive() {
            return Err(WalletError::InvalidAmount(amount));
        }
        let mut balances = self.balances.lock().await;
        let balance = *balances.entry(user_id).or_insert(self.opening_balance);
        let new_balance = balance
            .checked_add(amount)
            .ok_or(WalletError::InvalidAmount(amount))?;
        balances.insert(user_id, new_balance);
        Ok(new_balance)
    }

    async fn balance(&self, user_id: UserId) -> Result<Amount, WalletError> {
        let balances = self.balances.lock().await;
        Ok(balances.get(&user_id).copied().unwrap_or(self.opening_balance))
    }
}

/// Bets held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBetRepository {
    bets: RwLock<BTreeMap<BetId, ActiveBet>>,
}

impl InMemoryBetRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a bet by id.
    pub async fn get(&self, bet_id: BetId) -> Option<ActiveBet> {
        self.bets.read().await.get(&bet_id).cloned()
    }

    /// Number of stored bets.
    pub async fn len(&self) -> usize {
        self.bets.read().await.len()
    }
}

#[async_trait]
impl BetRepository for InMemoryBetRepository {
    async fn create(&self, bet: &ActiveBet) -> Result<(), StoreError> {
        let mut bets = self.bets.write().await;
        let clash = bets.contains_key(&bet.id)
            || bets
                .values()
                .any(|b| b.user_id == bet.user_id && b.round_id == bet.round_id);
        if clash {
            return Err(StoreError::Duplicate(format!("bet {} for user {}", bet.id, bet.user_id)));
        }
        bets.insert(bet.id, bet.clone());
        Ok(())
    }

    async fn update(&self, bet: &ActiveBet) -> Result<(), StoreError> {
        let mut bets = self.bets.write().await;
        match bets.get_mut(&bet.id) {
            Some(slot) => {
                *slot = bet.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("bet {}", bet.id))),
        }
    }

    async fn pending(&self) -> Result<Vec<ActiveBet>, StoreError> {
        let bets = self.bets.read().await;
        Ok(bets.values().filter(|b| b.status == BetStatus::Pending).cloned().collect())
    }

    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<ActiveBet>, StoreError> {
        let bets = self.bets.read().await;
        let mut mine: Vec<ActiveBet> = bets.values().filter(|b| b.user_id == user_id).cloned().collect();
        mine.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        mine.truncate(limit);
        Ok(mine)
    }
}

/// Rounds held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRoundRepository {
    rounds: RwLock<BTreeMap<RoundId, Round>>,
}

impl InMemoryRoundRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoundRepository for InMemoryRoundRepository {
    async fn create(&self, round: &Round) -> Result<(), StoreError> {
        let mut rounds = self.rounds.write().await;
        if rounds.contains_key(&round.id) {
            return Err(StoreError::Duplicate(format!("round {}", round.id)));
        }
        rounds.insert(round.id, round.clone());
        Ok(())
    }

    async fn update(&self, round: &Round) -> Result<(), StoreError> {
        let mut rounds = self.rounds.write().await;
        match rounds.get_mut(&round.id) {
            Some(slot) => {
                *slot = round.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("round {}", round.id))),
        }
    }

    async fn get(&self, round_id: RoundId) -> Result<Option<Round>, StoreError> {
        Ok(self.rounds.read().await.get(&round_id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Round>, StoreError> {
        let rounds = self.rounds.read().await;
        let mut all: Vec<Round> = rounds.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }
}
