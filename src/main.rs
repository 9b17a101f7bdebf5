//! Crash Round Server
//!
//! Runs the round engine behind the WebSocket transport, with in-memory
//! wallet and repositories. Nothing but the shutdown snapshot outlives the
//! process, so a restart settles the snapshot's pending bets as lost and
//! logs that their stored rows are gone.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crash_round::{
    core::rng::OsSeedSource,
    game::{
        config::EngineConfig,
        crash_point::CrashPointGenerator,
        engine::{Collaborators, RoundEngine},
        events::ChannelBroadcaster,
        recovery::RecoverySnapshot,
        runner::EngineRunner,
    },
    network::{AuthConfig, GameServer, JwtValidator, ServerConfig},
    store::{InMemoryBetRepository, InMemoryRoundRepository, InMemoryWallet},
    VERSION,
};

/// Broadcast buffer per subscriber; slower clients resync from state.
const EVENT_BUFFER: usize = 1024;

/// Engine command queue depth.
const COMMAND_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Crash Round Server v{}", VERSION);

    let engine_config = EngineConfig::from_env();
    let server_config = ServerConfig::from_env();
    let auth_config = AuthConfig::from_env();
    if !auth_config.is_configured() {
        warn!("No JWT_SECRET or AUTH_PUBLIC_KEY_PEM set; every login will be rejected");
    }
    info!(
        "Countdown {:?}, tick {:?}, growth {}bp/s, crash points {}..{}",
        engine_config.countdown,
        engine_config.tick_interval,
        engine_config.growth_rate_bp,
        engine_config.crash_bounds.min,
        engine_config.crash_bounds.max
    );

    let events = ChannelBroadcaster::new(EVENT_BUFFER);
    let collaborators = Collaborators {
        wallet: Arc::new(InMemoryWallet::with_opening_balance(server_config.opening_balance)),
        bets: Arc::new(InMemoryBetRepository::new()),
        rounds: Arc::new(InMemoryRoundRepository::new()),
        broadcaster: Arc::new(events.clone()),
    };
    let generator = CrashPointGenerator::new(Box::new(OsSeedSource), engine_config.crash_bounds);
    let mut engine = RoundEngine::new(engine_config, generator, collaborators);

    // Settle whatever the previous process left behind. The in-memory
    // repositories start empty, so only the snapshot's bets are recoverable.
    warn!("Bets and rounds are kept in memory and will not survive a restart");
    match RecoverySnapshot::take(&server_config.recovery_path).await {
        Ok(Some(snapshot)) => {
            let report = engine.recover(snapshot).await?;
            info!("Recovered interrupted round: {} bets settled", report.settled.len());
        }
        Ok(None) => {}
        Err(e) => warn!("Ignoring unreadable snapshot: {}", e),
    }
    engine.recover_pending().await?;

    let (runner, handle) = EngineRunner::new(engine, COMMAND_BUFFER);
    let (engine_shutdown_tx, engine_shutdown_rx) = broadcast::channel(1);
    let runner_task = tokio::spawn(runner.run(engine_shutdown_rx));

    let server = Arc::new(GameServer::new(
        server_config.clone(),
        handle,
        Arc::new(JwtValidator::new(auth_config)),
        events,
    ));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Ctrl-C received, shutting down");
        }
        result = wait_server(server_task) => {
            if let Err(e) = result {
                error!("Server stopped: {:#}", e);
            }
        }
    }

    server.shutdown();
    let _ = engine_shutdown_tx.send(());

    if let Some(snapshot) = runner_task.await.context("engine task panicked")? {
        snapshot
            .save(&server_config.recovery_path)
            .await
            .context("failed to save shutdown snapshot")?;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_server(
    task: tokio::task::JoinHandle<Result<(), crash_round::network::GameServerError>>,
) -> anyhow::Result<()> {
    task.await.context("server task panicked")??;
    Ok(())
}
