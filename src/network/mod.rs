//! Network Layer
//!
//! WebSocket transport for players. Holds no game state; every command is
//! forwarded to the engine task and every event comes from its broadcaster.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{AuthConfig, AuthError, AuthValidator, Identity, JwtValidator, TokenClaims, validate_token};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use server::{Connection, GameServer, GameServerError, ServerConfig};
