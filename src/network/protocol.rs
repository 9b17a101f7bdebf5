//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::core::money::Amount;
use crate::game::engine::{BetReceipt, CashOutReceipt, EngineError, RoundSummary, StateView};
use crate::game::events::EngineEvent;
use crate::game::state::{ActiveBet, UserId};

/// Default rows for bet history.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Default rows for the round list.
pub const DEFAULT_ROUNDS_LIMIT: usize = 10;

/// Upper bound on any list request.
pub const MAX_LIST_LIMIT: usize = 100;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with a JWT.
    Auth {
        /// Bearer token.
        token: String,
    },

    /// Stake on the live round.
    PlaceBet {
        /// Stake in currency units.
        amount: Amount,
    },

    /// Cash out at the current multiplier.
    CashOut,

    /// Request current state.
    GetState,

    /// Request own bet history.
    History {
        /// Maximum rows.
        #[serde(default)]
        limit: Option<usize>,
    },

    /// Request recent rounds.
    RecentRounds {
        /// Maximum rows.
        #[serde(default)]
        limit: Option<usize>,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// Clamp a requested list size.
pub fn list_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Authoritative state snapshot.
    State(StateView),

    /// Engine event.
    Event(EngineEvent),

    /// Reply to `place_bet`.
    BetPlaced(BetReceipt),

    /// Reply to `cash_out`.
    CashedOut(CashOutReceipt),

    /// Own bet history.
    History {
        /// Newest first.
        bets: Vec<ActiveBet>,
    },

    /// Recent rounds.
    Rounds {
        /// Newest first.
        rounds: Vec<RoundSummary>,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time in Unix milliseconds.
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Account id if successful.
    pub user_id: Option<UserId>,
    /// Display name if successful.
    pub username: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Error sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Command needs authentication.
    NotAuthenticated,
    /// Token rejected.
    AuthFailed,
    /// Malformed message.
    InvalidInput,
    /// Wrong phase for the command.
    InvalidPhase,
    /// Second bet in one round.
    DuplicateBet,
    /// Wallet could not cover the stake.
    InsufficientBalance,
    /// No bet to cash out.
    NoActiveBet,
    /// Cash-out already done.
    AlreadyCashedOut,
    /// Stake outside limits.
    InvalidStake,
    /// Wallet or storage unavailable.
    ServiceUnavailable,
    /// Anything else.
    InternalError,
}

impl From<&EngineError> for ServerError {
    fn from(err: &EngineError) -> Self {
        let code = match err {
            EngineError::InvalidPhase { .. } => ErrorCode::InvalidPhase,
            EngineError::DuplicateBet => ErrorCode::DuplicateBet,
            EngineError::InsufficientBalance => ErrorCode::InsufficientBalance,
            EngineError::NoActiveBet => ErrorCode::NoActiveBet,
            EngineError::AlreadyCashedOut => ErrorCode::AlreadyCashedOut,
            EngineError::InvalidStake { .. } => ErrorCode::InvalidStake,
            EngineError::Collaborator(_) => ErrorCode::ServiceUnavailable,
            EngineError::EngineStopped => ErrorCode::InternalError,
        };
        // Collaborator details stay in the server log
        let message = match err {
            EngineError::Collaborator(_) => "Service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        Self { code, message }
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::Multiplier;
    use crate::game::engine::CollaboratorError;
    use crate::game::state::{Bettor, RoundPhase};
    use uuid::Uuid;

    #[test]
    fn test_parse_client_commands() {
        let msg = ClientMessage::from_json(r#"{"type":"place_bet","amount":25.5}"#).unwrap();
        assert_eq!(msg, ClientMessage::PlaceBet { amount: Amount::from_cents(2550) });

        let msg = ClientMessage::from_json(r#"{"type":"cash_out"}"#).unwrap();
        assert_eq!(msg, ClientMessage::CashOut);

        let msg = ClientMessage::from_json(r#"{"type":"history"}"#).unwrap();
        assert_eq!(msg, ClientMessage::History { limit: None });

        let msg = ClientMessage::from_json(r#"{"type":"recent_rounds","limit":5}"#).unwrap();
        assert_eq!(msg, ClientMessage::RecentRounds { limit: Some(5) });

        assert!(ClientMessage::from_json(r#"{"type":"withdraw"}"#).is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let msg = ServerMessage::Event(EngineEvent::MultiplierTick {
            multiplier: Multiplier::from_hundredths(115),
            round_id: Uuid::nil(),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "multiplier_tick");
        assert_eq!(value["multiplier"], 1.15);

        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_receipt_wire_shape() {
        let msg = ServerMessage::CashedOut(CashOutReceipt {
            multiplier: Multiplier::from_hundredths(150),
            win_amount: Amount::from_units(15),
            balance: Amount::from_cents(10_550),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "cashed_out");
        assert_eq!(value["win_amount"], 15.0);
        assert_eq!(value["balance"], 105.5);
        assert_eq!(ServerMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);

        let msg = ServerMessage::BetPlaced(BetReceipt {
            bet_id: Uuid::nil(),
            amount: Amount::from_units(10),
            round_id: Uuid::nil(),
        });
        assert!(msg.to_json().unwrap().contains(r#""type":"bet_placed""#));
    }

    #[test]
    fn test_history_round_trips() {
        let bettor = Bettor::new(4, "dave");
        let bet = ActiveBet::new(&bettor, Uuid::new_v4(), Amount::from_units(25)).lost();
        let msg = ServerMessage::History { bets: vec![bet] };
        assert_eq!(ServerMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_state_wire_shape() {
        let msg = ServerMessage::State(StateView {
            phase: RoundPhase::Running,
            multiplier: Multiplier::from_hundredths(150),
            round_id: None,
            crash_point: None,
            fairness_hash: None,
            has_bet: true,
            has_cashed_out: false,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"state""#));
        assert!(json.contains(r#""phase":"running""#));
        assert!(json.contains(r#""has_bet":true"#));
    }

    #[test]
    fn test_engine_errors_map_to_codes() {
        let cases = [
            (EngineError::InvalidPhase { phase: RoundPhase::Running }, ErrorCode::InvalidPhase),
            (EngineError::DuplicateBet, ErrorCode::DuplicateBet),
            (EngineError::InsufficientBalance, ErrorCode::InsufficientBalance),
            (EngineError::NoActiveBet, ErrorCode::NoActiveBet),
            (EngineError::AlreadyCashedOut, ErrorCode::AlreadyCashedOut),
            (
                EngineError::Collaborator(CollaboratorError::Timeout("wallet debit")),
                ErrorCode::ServiceUnavailable,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(ServerError::from(&err).code, code);
        }

        let hidden = ServerError::from(&EngineError::Collaborator(CollaboratorError::Repository(
            "password=hunter2".into(),
        )));
        assert!(!hidden.message.contains("hunter2"));
    }

    #[test]
    fn test_error_code_wire_format() {
        let msg = ServerMessage::Error(ServerError::new(ErrorCode::AlreadyCashedOut, "already cashed out"));
        assert!(msg.to_json().unwrap().contains("already_cashed_out"));
    }

    #[test]
    fn test_list_limit_clamped() {
        assert_eq!(list_limit(None, DEFAULT_HISTORY_LIMIT), 20);
        assert_eq!(list_limit(Some(0), DEFAULT_ROUNDS_LIMIT), 1);
        assert_eq!(list_limit(Some(10_000), DEFAULT_ROUNDS_LIMIT), MAX_LIST_LIMIT);
    }
}
