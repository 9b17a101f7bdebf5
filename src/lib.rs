//! # Crash Round Server
//!
//! Authoritative round engine for a multiplayer crash betting game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH ROUND SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Primitives                              │
//! │  ├── money.rs      - Integer cents and multipliers           │
//! │  └── rng.rs        - Round seed sources                      │
//! │                                                              │
//! │  game/             - Round engine (single writer)            │
//! │  ├── engine.rs     - Phase machine, bets, cash-outs          │
//! │  ├── runner.rs     - Engine task and command handle          │
//! │  ├── crash_point.rs- Seeded crash point draw                 │
//! │  ├── clock.rs      - Multiplier growth curve                 │
//! │  ├── settlement.rs - Crash settlement                        │
//! │  └── recovery.rs   - Shutdown snapshot                       │
//! │                                                              │
//! │  proof/            - Commit-reveal fairness                  │
//! │  store/            - Wallet and repository traits            │
//! │                                                              │
//! │  network/          - WebSocket transport                     │
//! │  ├── server.rs     - Accept loop and connections             │
//! │  ├── protocol.rs   - Message types                           │
//! │  └── auth.rs       - JWT validation                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Guarantee
//!
//! One task owns all round state. Bets, cash-outs, ticks and the crash are
//! applied strictly one after another, so:
//! - A user holds at most one bet per round
//! - A bet is paid at most once
//! - Cash-outs only ever see a multiplier below the crash point
//! - Every bet is won or lost once the round has crashed
//!
//! Money is integer cents and multipliers are integer hundredths; floats
//! appear only on the JSON wire.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod proof;
pub mod store;

// Re-export commonly used types
pub use core::money::{Amount, Multiplier};
pub use game::engine::{EngineError, RoundEngine};
pub use game::runner::{EngineHandle, EngineRunner};
pub use game::state::{RoundPhase, UserId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
