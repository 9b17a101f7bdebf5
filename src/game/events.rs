//! Engine Events
//!
//! Everything the engine tells the outside world, in the order state
//! changed. Delivery is best effort: clients treat these as hints and use
//! `get_state` when they need the truth.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::money::{Amount, Multiplier};
use crate::game::state::{BetId, RoundId, RoundPhase, UserId};

/// Who should receive an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Every connected client.
    All,
    /// Only this user's connections.
    User(UserId),
}

/// Engine event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Phase changed.
    RoundState {
        /// Phase just entered.
        phase: RoundPhase,
        /// Live round, if any.
        round_id: Option<RoundId>,
        /// Seconds of countdown (countdown phase only).
        #[serde(skip_serializing_if = "Option::is_none")]
        countdown: Option<u32>,
        /// Seed commitment (countdown phase only).
        #[serde(skip_serializing_if = "Option::is_none")]
        fairness_hash: Option<String>,
    },

    /// One second of countdown elapsed.
    CountdownTick {
        /// Seconds until the round starts running.
        seconds_remaining: u32,
    },

    /// Multiplier advanced.
    MultiplierTick {
        /// Current multiplier.
        multiplier: Multiplier,
        /// Running round.
        round_id: RoundId,
    },

    /// Bet placed (to the bettor).
    BetAccepted {
        /// Stored bet.
        bet_id: BetId,
        /// Stake.
        amount: Amount,
        /// Round the bet is on.
        round_id: RoundId,
    },

    /// Cash-out succeeded (to the bettor).
    CashOutResult {
        /// Multiplier locked in.
        multiplier: Multiplier,
        /// Amount credited.
        win_amount: Amount,
        /// Wallet balance after the credit.
        balance: Amount,
    },

    /// Someone placed a bet.
    PeerBet {
        /// Display name of the bettor.
        username: String,
        /// Stake.
        amount: Amount,
    },

    /// Someone cashed out.
    PeerCashOut {
        /// Display name of the player.
        username: String,
        /// Multiplier locked in.
        multiplier: Multiplier,
        /// Amount won.
        win_amount: Amount,
    },

    /// Round ended; crash point and seed are now public.
    RoundCrashed {
        /// Final multiplier.
        crash_point: Multiplier,
        /// Round that ended.
        round_id: RoundId,
        /// Hex seed that opens the countdown commitment.
        seed: String,
    },
}

/// An event plus its audience.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    /// Recipients.
    pub audience: Audience,
    /// Payload.
    pub event: EngineEvent,
}

impl Outbound {
    /// Event for everyone.
    pub fn all(event: EngineEvent) -> Self {
        Self { audience: Audience::All, event }
    }

    /// Event for one user.
    pub fn to_user(user_id: UserId, event: EngineEvent) -> Self {
        Self { audience: Audience::User(user_id), event }
    }

    /// Whether `user_id` (or an anonymous viewer when `None`) should see this.
    pub fn is_for(&self, user_id: Option<UserId>) -> bool {
        match self.audience {
            Audience::All => true,
            Audience::User(target) => user_id == Some(target),
        }
    }
}

/// Fire-and-forget event sink.
pub trait Broadcaster: Send + Sync {
    /// Publish an event. Must not block.
    fn publish(&self, outbound: Outbound);
}

/// Broadcaster backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Outbound>,
}

impl ChannelBroadcaster {
    /// Create with room for `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, outbound: Outbound) {
        // No subscribers is fine
        if self.tx.send(outbound).is_err() {
            trace!("event dropped, no subscribers");
        }
    }
}
