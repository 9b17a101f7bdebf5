//! Game Logic Module
//!
//! The round engine and everything it decides with.
//!
//! ## Module Structure
//!
//! - `state`: Rounds, bets, engine state
//! - `ledger`: Per-round bet bookkeeping
//! - `crash_point`: Seeded crash point draw
//! - `clock`: Multiplier growth curve
//! - `settlement`: Marking outstanding bets lost at the crash
//! - `engine`: Phase state machine and commands
//! - `runner`: Single-task driver and command handle
//! - `events`: Broadcast events and fan-out
//! - `recovery`: Shutdown snapshot
//! - `config`: Engine settings

pub mod clock;
pub mod config;
pub mod crash_point;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod recovery;
pub mod runner;
pub mod settlement;
pub mod state;

// Re-export key types
pub use config::EngineConfig;
pub use crash_point::{CrashBounds, CrashPointGenerator};
pub use engine::{
    BetReceipt, CashOutReceipt, Collaborators, CollaboratorError, EngineError, RoundEngine, RoundSummary,
    StateView,
};
pub use events::{Audience, Broadcaster, ChannelBroadcaster, EngineEvent, Outbound};
pub use recovery::{RecoveryError, RecoverySnapshot};
pub use runner::{EngineHandle, EngineRunner};
pub use state::{ActiveBet, BetStatus, Bettor, EngineState, Round, RoundId, RoundPhase, UserId};
