//! Collaborator Stores
//!
//! The engine never touches money or persistence directly. It calls these
//! traits, each of which may be slow or fail; the engine bounds every call
//! with a timeout and keeps its own state consistent either way.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::money::Amount;
use crate::game::state::{ActiveBet, Round, RoundId, UserId};

pub mod memory;

pub use memory::{InMemoryBetRepository, InMemoryRoundRepository, InMemoryWallet};

/// Wallet failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    /// Balance is lower than the debit.
    #[error("insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance {
        /// Balance at the time of the debit.
        balance: Amount,
        /// Amount requested.
        requested: Amount,
    },

    /// Amount is zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(Amount),

    /// Backend failure.
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}

/// Repository failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Record already exists.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Backend failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// User balances. Debit and credit must be atomic per user.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Check and subtract `amount`; returns the new balance.
    async fn debit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError>;

    /// Add `amount`; returns the new balance.
    async fn credit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError>;

    /// Current balance.
    async fn balance(&self, user_id: UserId) -> Result<Amount, WalletError>;
}

/// Durable bets.
#[async_trait]
pub trait BetRepository: Send + Sync {
    /// Store a new bet.
    async fn create(&self, bet: &ActiveBet) -> Result<(), StoreError>;

    /// Overwrite a bet by id.
    async fn update(&self, bet: &ActiveBet) -> Result<(), StoreError>;

    /// Every bet still pending, across rounds.
    async fn pending(&self) -> Result<Vec<ActiveBet>, StoreError>;

    /// A user's most recent bets, newest first.
    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<ActiveBet>, StoreError>;
}

/// Durable rounds.
#[async_trait]
pub trait RoundRepository: Send + Sync {
    /// Store a new round.
    async fn create(&self, round: &Round) -> Result<(), StoreError>;

    /// Overwrite a round by id.
    async fn update(&self, round: &Round) -> Result<(), StoreError>;

    /// Look up a round.
    async fn get(&self, round_id: RoundId) -> Result<Option<Round>, StoreError>;

    /// Most recent rounds, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Round>, StoreError>;
}
