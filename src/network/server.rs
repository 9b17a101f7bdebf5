//! WebSocket Game Server
//!
//! Async WebSocket server for player connections. Each connection
//! authenticates, forwards commands to the engine task, and relays engine
//! events (events addressed to one user only reach that user).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::money::Amount;
use crate::game::events::ChannelBroadcaster;
use crate::game::runner::EngineHandle;
use crate::game::state::UserId;
use crate::network::auth::{AuthValidator, Identity};
use crate::network::protocol::{
    list_limit, AuthResult, ClientMessage, ErrorCode, ServerError, ServerMessage, DEFAULT_HISTORY_LIMIT,
    DEFAULT_ROUNDS_LIMIT,
};

/// Grace period for flushing the last messages of a closing connection.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Where the shutdown snapshot is kept.
    pub recovery_path: PathBuf,
    /// Balance credited to unknown users by the in-memory wallet.
    pub opening_balance: Amount,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            recovery_path: PathBuf::from("crash-round.snapshot"),
            opening_balance: Amount::ZERO,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let bind_addr = match std::env::var("BIND_ADDR") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid BIND_ADDR={:?}", raw);
                defaults.bind_addr
            }),
            Err(_) => defaults.bind_addr,
        };
        let max_connections = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_connections);
        let opening_balance = std::env::var("OPENING_BALANCE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(Amount::from_decimal)
            .unwrap_or(defaults.opening_balance);

        Self {
            bind_addr,
            max_connections,
            recovery_path: std::env::var("RECOVERY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.recovery_path),
            opening_balance,
            version: defaults.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Account (after auth).
    user_id: Option<UserId>,
    /// Connection time.
    connected_at: Instant,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// One client's command handling, independent of the socket.
pub struct Connection {
    addr: SocketAddr,
    engine: EngineHandle,
    auth: Arc<dyn AuthValidator>,
    version: String,
    identity: Option<Identity>,
    sender: mpsc::Sender<ServerMessage>,
}

impl Connection {
    /// New unauthenticated connection writing replies to `sender`.
    pub fn new(
        addr: SocketAddr,
        engine: EngineHandle,
        auth: Arc<dyn AuthValidator>,
        version: String,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            addr,
            engine,
            auth,
            version,
            identity: None,
            sender,
        }
    }

    /// Authenticated account, if any.
    pub fn user_id(&self) -> Option<UserId> {
        self.identity.as_ref().map(|i| i.user_id)
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.sender.send(msg).await;
    }

    async fn send_error(&self, error: ServerError) {
        self.send(ServerMessage::Error(error)).await;
    }

    /// Push current state to the client.
    pub async fn send_state(&self) {
        match self.engine.get_state(self.user_id()).await {
            Ok(view) => self.send(ServerMessage::State(view)).await,
            Err(e) => self.send_error(ServerError::from(&e)).await,
        }
    }

    fn require_identity(&self) -> Result<&Identity, ServerError> {
        self.identity
            .as_ref()
            .ok_or_else(|| ServerError::new(ErrorCode::NotAuthenticated, "Must authenticate first"))
    }

    /// Handle one client message.
    pub async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Auth { token } => self.handle_auth(&token).await,
            ClientMessage::PlaceBet { amount } => {
                let bettor = match self.require_identity() {
                    Ok(identity) => identity.bettor(),
                    Err(e) => return self.send_error(e).await,
                };
                match self.engine.place_bet(bettor, amount).await {
                    Ok(receipt) => self.send(ServerMessage::BetPlaced(receipt)).await,
                    Err(e) => {
                        debug!("Bet from {} rejected: {}", self.addr, e);
                        self.send_error(ServerError::from(&e)).await;
                    }
                }
            }
            ClientMessage::CashOut => {
                let user_id = match self.require_identity() {
                    Ok(identity) => identity.user_id,
                    Err(e) => return self.send_error(e).await,
                };
                match self.engine.cash_out(user_id).await {
                    Ok(receipt) => self.send(ServerMessage::CashedOut(receipt)).await,
                    Err(e) => {
                        debug!("Cash-out from {} rejected: {}", self.addr, e);
                        self.send_error(ServerError::from(&e)).await;
                    }
                }
            }
            ClientMessage::GetState => self.send_state().await,
            ClientMessage::History { limit } => {
                let user_id = match self.require_identity() {
                    Ok(identity) => identity.user_id,
                    Err(e) => return self.send_error(e).await,
                };
                match self.engine.history(user_id, list_limit(limit, DEFAULT_HISTORY_LIMIT)).await {
                    Ok(bets) => self.send(ServerMessage::History { bets }).await,
                    Err(e) => self.send_error(ServerError::from(&e)).await,
                }
            }
            ClientMessage::RecentRounds { limit } => {
                match self.engine.recent_rounds(list_limit(limit, DEFAULT_ROUNDS_LIMIT)).await {
                    Ok(rounds) => self.send(ServerMessage::Rounds { rounds }).await,
                    Err(e) => self.send_error(ServerError::from(&e)).await,
                }
            }
            ClientMessage::Ping { timestamp } => {
                self.send(ServerMessage::Pong {
                    timestamp,
                    server_time: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                })
                .await;
            }
        }
    }

    async fn handle_auth(&mut self, token: &str) {
        match self.auth.validate(token) {
            Ok(identity) => {
                debug!("Client {} authenticated as {} ({})", self.addr, identity.username, identity.user_id);
                self.send(ServerMessage::AuthResult(AuthResult {
                    success: true,
                    user_id: Some(identity.user_id),
                    username: Some(identity.username.clone()),
                    error: None,
                    server_version: self.version.clone(),
                }))
                .await;
                self.identity = Some(identity);
                self.send_state().await;
            }
            Err(e) => {
                debug!("Client {} failed auth: {}", self.addr, e);
                self.send(ServerMessage::AuthResult(AuthResult {
                    success: false,
                    user_id: None,
                    username: None,
                    error: Some(e.to_string()),
                    server_version: self.version.clone(),
                }))
                .await;
            }
        }
    }
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Engine task.
    engine: EngineHandle,
    /// Token validation.
    auth: Arc<dyn AuthValidator>,
    /// Engine event source.
    events: ChannelBroadcaster,
    /// Connected clients.
    clients: Clients,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(
        config: ServerConfig,
        engine: EngineHandle,
        auth: Arc<dyn AuthValidator>,
        events: ChannelBroadcaster,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            engine,
            auth,
            events,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let engine = self.engine.clone();
        let auth = self.auth.clone();
        let version = self.config.version.clone();
        let mut events = self.events.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            clients.write().await.insert(
                addr,
                ConnectedClient {
                    user_id: None,
                    connected_at: Instant::now(),
                },
            );

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut connection = Connection::new(addr, engine, auth, version, msg_tx);
            connection.send_state().await;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        connection
                                            .send_error(ServerError::new(ErrorCode::InvalidInput, "Invalid message format"))
                                            .await;
                                        continue;
                                    }
                                };

                                let before = connection.user_id();
                                connection.handle(client_msg).await;
                                if connection.user_id() != before {
                                    if let Some(client) = clients.write().await.get_mut(&addr) {
                                        client.user_id = connection.user_id();
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                connection
                                    .send_error(ServerError::new(ErrorCode::InvalidInput, "Binary frames are not supported"))
                                    .await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(outbound) => {
                                if outbound.is_for(connection.user_id()) {
                                    connection.send(ServerMessage::Event(outbound.event)).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Client {} lagged by {} events, resyncing", addr, skipped);
                                connection.send_state().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        connection.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued messages drain before the socket closes
            drop(connection);
            if tokio::time::timeout(FLUSH_TIMEOUT, sender_task).await.is_err() {
                debug!("Client {} did not drain in time", addr);
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    "Client {} (user {:?}) cleaned up after {:?}",
                    addr,
                    client.user_id,
                    client.connected_at.elapsed()
                );
            }
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get authenticated connection count.
    pub async fn authenticated_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.user_id.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::Multiplier;
    use crate::core::rng::SequenceSeedSource;
    use crate::game::config::EngineConfig;
    use crate::game::crash_point::{CrashBounds, CrashPointGenerator};
    use crate::game::engine::{Collaborators, RoundEngine};
    use crate::game::runner::EngineRunner;
    use crate::game::state::RoundPhase;
    use crate::network::auth::AuthError;
    use crate::store::{InMemoryBetRepository, InMemoryRoundRepository, InMemoryWallet};

    /// Accepts tokens of the form `user:<id>:<name>`.
    struct StaticTokens;

    impl AuthValidator for StaticTokens {
        fn validate(&self, token: &str) -> Result<Identity, AuthError> {
            let mut parts = token.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("user"), Some(id), Some(name)) => Ok(Identity {
                    user_id: UserId(id.parse().map_err(|_| AuthError::InvalidFormat)?),
                    username: name.to_string(),
                }),
                _ => Err(AuthError::InvalidFormat),
            }
        }
    }

    fn start_engine() -> (EngineHandle, ChannelBroadcaster, broadcast::Sender<()>) {
        let events = ChannelBroadcaster::new(256);
        let engine = RoundEngine::new(
            EngineConfig::default(),
            CrashPointGenerator::new(Box::new(SequenceSeedSource::from_draws(&[0x8ddd_a378])), CrashBounds::default()),
            Collaborators {
                wallet: Arc::new(InMemoryWallet::with_opening_balance(Amount::from_units(100))),
                bets: Arc::new(InMemoryBetRepository::new()),
                rounds: Arc::new(InMemoryRoundRepository::new()),
                broadcaster: Arc::new(events.clone()),
            },
        );
        let (runner, handle) = EngineRunner::new(engine, 64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(runner.run(shutdown_rx));
        (handle, events, shutdown_tx)
    }

    fn connection(engine: EngineHandle) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let addr = SocketAddr::from(([127, 0, 0, 1], 9000));
        (Connection::new(addr, engine, Arc::new(StaticTokens), "test".into(), tx), rx)
    }

    fn expect_error(msg: ServerMessage) -> ErrorCode {
        match msg {
            ServerMessage::Error(e) => e.code,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.opening_balance, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_commands_require_auth() {
        let (engine, _events, _shutdown) = start_engine();
        let (mut conn, mut rx) = connection(engine);

        conn.handle(ClientMessage::PlaceBet { amount: Amount::from_units(10) }).await;
        assert_eq!(expect_error(rx.recv().await.unwrap()), ErrorCode::NotAuthenticated);

        conn.handle(ClientMessage::CashOut).await;
        assert_eq!(expect_error(rx.recv().await.unwrap()), ErrorCode::NotAuthenticated);

        conn.handle(ClientMessage::History { limit: None }).await;
        assert_eq!(expect_error(rx.recv().await.unwrap()), ErrorCode::NotAuthenticated);

        // Public queries work anonymously
        conn.handle(ClientMessage::RecentRounds { limit: None }).await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Rounds { .. }));
    }

    #[tokio::test]
    async fn test_auth_then_bet() {
        let (engine, _events, _shutdown) = start_engine();
        let (mut conn, mut rx) = connection(engine);

        conn.handle(ClientMessage::Auth { token: "garbage".into() }).await;
        match rx.recv().await.unwrap() {
            ServerMessage::AuthResult(result) => assert!(!result.success),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.user_id(), None);

        conn.handle(ClientMessage::Auth { token: "user:7:alice".into() }).await;
        match rx.recv().await.unwrap() {
            ServerMessage::AuthResult(result) => {
                assert!(result.success);
                assert_eq!(result.user_id, Some(UserId(7)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ServerMessage::State(view) => assert_eq!(view.phase, RoundPhase::Countdown),
            other => panic!("unexpected {:?}", other),
        }

        conn.handle(ClientMessage::PlaceBet { amount: Amount::from_units(10) }).await;
        match rx.recv().await.unwrap() {
            ServerMessage::BetPlaced(receipt) => assert_eq!(receipt.amount, Amount::from_units(10)),
            other => panic!("unexpected {:?}", other),
        }
        conn.handle(ClientMessage::PlaceBet { amount: Amount::from_units(10) }).await;
        assert_eq!(expect_error(rx.recv().await.unwrap()), ErrorCode::DuplicateBet);

        conn.handle(ClientMessage::GetState).await;
        match rx.recv().await.unwrap() {
            ServerMessage::State(view) => assert!(view.has_bet),
            other => panic!("unexpected {:?}", other),
        }

        conn.handle(ClientMessage::CashOut).await;
        assert_eq!(expect_error(rx.recv().await.unwrap()), ErrorCode::InvalidPhase);

        conn.handle(ClientMessage::History { limit: Some(5) }).await;
        match rx.recv().await.unwrap() {
            ServerMessage::History { bets } => assert_eq!(bets.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cash_out_reply_carries_receipt() {
        let (engine, _events, _shutdown) = start_engine();
        let (mut conn, mut rx) = connection(engine);

        conn.handle(ClientMessage::Auth { token: "user:3:carol".into() }).await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::AuthResult(_)));
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::State(_)));

        conn.handle(ClientMessage::PlaceBet { amount: Amount::from_units(10) }).await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::BetPlaced(_)));

        // Countdown is 5s; the 2.00x round is still running a second later
        tokio::time::sleep(Duration::from_millis(6_050)).await;
        conn.handle(ClientMessage::CashOut).await;
        match rx.recv().await.unwrap() {
            ServerMessage::CashedOut(receipt) => {
                assert!(receipt.multiplier > Multiplier::ONE);
                assert_eq!(receipt.win_amount, Amount::from_units(10).scaled_by(receipt.multiplier));
                assert_eq!(
                    Some(receipt.balance),
                    Amount::from_units(90).checked_add(receipt.win_amount)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (engine, _events, _shutdown) = start_engine();
        let (mut conn, mut rx) = connection(engine);
        conn.handle(ClientMessage::Ping { timestamp: 42 }).await;
        match rx.recv().await.unwrap() {
            ServerMessage::Pong { timestamp, server_time } => {
                assert_eq!(timestamp, 42);
                assert!(server_time > 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        use tokio_tungstenite::connect_async;

        let (engine, events, _engine_shutdown) = start_engine();
        let server = Arc::new(GameServer::new(
            ServerConfig::default(),
            engine,
            Arc::new(StaticTokens),
            events,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        // Greeted with the current state
        let first = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break ServerMessage::from_json(&text).unwrap(),
                _ => continue,
            }
        };
        assert!(matches!(first, ServerMessage::State(_)));

        let auth = ClientMessage::Auth { token: "user:9:bob".into() }.to_json().unwrap();
        ws.send(Message::Text(auth)).await.unwrap();

        let mut authed = false;
        while !authed {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                if let ServerMessage::AuthResult(result) = ServerMessage::from_json(&text).unwrap() {
                    assert!(result.success);
                    authed = true;
                }
            }
        }

        // A later reply means the auth bookkeeping is done
        let ping = ClientMessage::Ping { timestamp: 1 }.to_json().unwrap();
        ws.send(Message::Text(ping)).await.unwrap();
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                if matches!(ServerMessage::from_json(&text), Ok(ServerMessage::Pong { .. })) {
                    break;
                }
            }
        }
        assert_eq!(server.connection_count().await, 1);
        assert_eq!(server.authenticated_count().await, 1);

        server.shutdown();
        let mut saw_shutdown = false;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                if matches!(ServerMessage::from_json(&text), Ok(ServerMessage::Shutdown { .. })) {
                    saw_shutdown = true;
                }
            }
        }
        assert!(saw_shutdown);
        assert!(serving.await.unwrap().is_ok());
    }
}
