//! Engine Task
//!
//! The [`RoundEngine`] lives inside a single task. Commands arrive over an
//! mpsc channel and are answered on oneshot channels; timers come from the
//! engine's own `next_wake`. Because one task does everything, commands and
//! ticks are applied strictly one at a time.
//!
//! Commands are polled before the timer, so a cash-out already queued when
//! the crash tick is due is judged first.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::core::money::Amount;
use crate::game::engine::{BetReceipt, CashOutReceipt, EngineError, RoundEngine, RoundSummary, StateView};
use crate::game::recovery::RecoverySnapshot;
use crate::game::state::{ActiveBet, Bettor, UserId};

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Requests handled by the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Stake on the live round.
    PlaceBet {
        /// Who is betting.
        bettor: Bettor,
        /// Stake.
        amount: Amount,
        /// Answer.
        reply: Reply<BetReceipt>,
    },
    /// Lock in the current multiplier.
    CashOut {
        /// Who is cashing out.
        user_id: UserId,
        /// Answer.
        reply: Reply<CashOutReceipt>,
    },
    /// Read authoritative state.
    GetState {
        /// Viewer, if authenticated.
        viewer: Option<UserId>,
        /// Answer.
        reply: oneshot::Sender<StateView>,
    },
    /// A user's recent bets.
    History {
        /// Whose bets.
        user_id: UserId,
        /// Maximum rows.
        limit: usize,
        /// Answer.
        reply: Reply<Vec<ActiveBet>>,
    },
    /// Recent rounds.
    RecentRounds {
        /// Maximum rows.
        limit: usize,
        /// Answer.
        reply: Reply<Vec<RoundSummary>>,
    },
}

/// Cloneable front door to the engine task.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    /// Stake `amount` on the live round.
    pub async fn place_bet(&self, bettor: Bettor, amount: Amount) -> Result<BetReceipt, EngineError> {
        self.request(|reply| EngineCommand::PlaceBet { bettor, amount, reply }).await
    }

    /// Cash out at the current multiplier.
    pub async fn cash_out(&self, user_id: UserId) -> Result<CashOutReceipt, EngineError> {
        self.request(|reply| EngineCommand::CashOut { user_id, reply }).await
    }

    /// Current state as seen by `viewer`.
    pub async fn get_state(&self, viewer: Option<UserId>) -> Result<StateView, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::GetState { viewer, reply })
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// A user's recent bets, newest first.
    pub async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<ActiveBet>, EngineError> {
        self.request(|reply| EngineCommand::History { user_id, limit, reply }).await
    }

    /// Recent rounds, newest first.
    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundSummary>, EngineError> {
        self.request(|reply| EngineCommand::RecentRounds { limit, reply }).await
    }
}

/// Owns the engine and drives it.
pub struct EngineRunner {
    engine: RoundEngine,
    commands: mpsc::Receiver<EngineCommand>,
}

impl EngineRunner {
    /// Wrap `engine`; `capacity` bounds the command queue.
    pub fn new(engine: RoundEngine, capacity: usize) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { engine, commands: rx }, EngineHandle { commands: tx })
    }

    /// Run until shutdown is signalled or every handle is dropped.
    ///
    /// Returns the snapshot of an unsettled round, if one was live.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Option<RecoverySnapshot> {
        info!("Round engine starting");
        // A failed start is rescheduled by the engine itself
        let _ = self.engine.start_new_round(Instant::now()).await;

        loop {
            let wake = self.engine.next_wake();
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Round engine shutting down");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => {
                        info!("All engine handles dropped");
                        break;
                    }
                },

                _ = wait_for(wake) => {
                    self.engine.on_timer(Instant::now()).await;
                }
            }
        }

        self.engine.snapshot()
    }

    async fn dispatch(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::PlaceBet { bettor, amount, reply } => {
                let result = self.engine.place_bet(&bettor, amount).await;
                let _ = reply.send(result);
            }
            EngineCommand::CashOut { user_id, reply } => {
                let result = self.engine.cash_out(user_id).await;
                let _ = reply.send(result);
            }
            EngineCommand::GetState { viewer, reply } => {
                let _ = reply.send(self.engine.get_state(viewer));
            }
            EngineCommand::History { user_id, limit, reply } => {
                let queries = self.engine.queries();
                tokio::spawn(async move {
                    let _ = reply.send(queries.history(user_id, limit).await);
                });
            }
            EngineCommand::RecentRounds { limit, reply } => {
                let queries = self.engine.queries();
                tokio::spawn(async move {
                    let _ = reply.send(queries.recent_rounds(limit).await);
                });
            }
        }
        debug!("Command handled in phase {:?}", self.engine.phase());
    }
}

async fn wait_for(wake: Option<Instant>) {
    match wake {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::Multiplier;
    use crate::core::rng::SequenceSeedSource;
    use crate::game::config::EngineConfig;
    use crate::game::crash_point::{CrashBounds, CrashPointGenerator};
    use crate::game::engine::Collaborators;
    use crate::game::events::ChannelBroadcaster;
    use crate::game::state::{BetStatus, RoundPhase};
    use crate::store::{InMemoryBetRepository, InMemoryRoundRepository, InMemoryWallet, WalletError, WalletStore};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    const DRAW_1_20: u32 = 0x2f68_4bda;

    fn runner(draws: &[u32], wallet: Arc<dyn WalletStore>) -> (EngineRunner, EngineHandle) {
        let generator = CrashPointGenerator::new(
            Box::new(SequenceSeedSource::from_draws(draws)),
            CrashBounds::default(),
        );
        let engine = RoundEngine::new(
            EngineConfig::default(),
            generator,
            Collaborators {
                wallet,
                bets: Arc::new(InMemoryBetRepository::new()),
                rounds: Arc::new(InMemoryRoundRepository::new()),
                broadcaster: Arc::new(ChannelBroadcaster::new(1024)),
            },
        );
        EngineRunner::new(engine, 64)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_plays_out_in_real_time() {
        let wallet = Arc::new(InMemoryWallet::with_opening_balance(Amount::from_units(1000)));
        let (runner, handle) = runner(&[DRAW_1_20], wallet.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let t0 = Instant::now();
        let task = tokio::spawn(runner.run(shutdown_rx));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.get_state(None).await.unwrap().phase, RoundPhase::Countdown);

        let alice = Bettor::new(1, "alice");
        let bob = Bettor::new(2, "bob");
        handle.place_bet(alice.clone(), Amount::from_units(100)).await.unwrap();
        handle.place_bet(bob.clone(), Amount::from_units(50)).await.unwrap();

        // Running from t0+5s; 1.15x three seconds later
        sleep_until(t0 + Duration::from_millis(8_050)).await;
        let view = handle.get_state(Some(UserId(1))).await.unwrap();
        assert_eq!(view.phase, RoundPhase::Running);
        assert_eq!(view.multiplier, Multiplier::from_hundredths(115));
        assert!(view.has_bet);

        let receipt = handle.cash_out(UserId(1)).await.unwrap();
        assert_eq!(receipt.multiplier, Multiplier::from_hundredths(115));
        assert_eq!(receipt.win_amount, Amount::from_units(115));

        sleep_until(t0 + Duration::from_millis(9_500)).await;
        let view = handle.get_state(None).await.unwrap();
        assert_eq!(view.phase, RoundPhase::Crashed);
        assert_eq!(view.crash_point, Some(Multiplier::from_hundredths(120)));

        let history = handle.history(UserId(2), 20).await.unwrap();
        assert_eq!(history[0].status, BetStatus::Lost);
        assert_eq!(wallet.balance(UserId(1)).await.unwrap(), Amount::from_units(1015));
        assert_eq!(wallet.balance(UserId(2)).await.unwrap(), Amount::from_units(950));

        shutdown_tx.send(()).unwrap();
        // Crashed rounds are already settled
        assert!(task.await.unwrap().is_none());
    }

    /// Wallet whose credits take 100ms.
    struct SlowCredits {
        inner: InMemoryWallet,
    }

    #[async_trait]
    impl WalletStore for SlowCredits {
        async fn debit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError> {
            self.inner.debit(user_id, amount).await
        }
        async fn credit(&self, user_id: UserId, amount: Amount) -> Result<Amount, WalletError> {
            sleep(Duration::from_millis(100)).await;
            self.inner.credit(user_id, amount).await
        }
        async fn balance(&self, user_id: UserId) -> Result<Amount, WalletError> {
            self.inner.balance(user_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cash_out_queued_at_crash_tick_is_honored() {
        let wallet = Arc::new(SlowCredits {
            inner: InMemoryWallet::with_opening_balance(Amount::from_units(1000)),
        });
        let (runner, handle) = runner(&[DRAW_1_20], wallet.clone());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let t0 = Instant::now();
        tokio::spawn(runner.run(shutdown_rx));

        sleep(Duration::from_millis(500)).await;
        handle.place_bet(Bettor::new(1, "alice"), Amount::from_units(100)).await.unwrap();
        handle.place_bet(Bettor::new(3, "carol"), Amount::from_units(10)).await.unwrap();

        // 1.19x since the t0+8.8s tick; the 1.20x crash tick is due at t0+8.9s
        sleep_until(t0 + Duration::from_millis(8_850)).await;
        let (carol_tx, carol_rx) = oneshot::channel();
        let (alice_tx, alice_rx) = oneshot::channel();
        handle
            .commands
            .try_send(EngineCommand::CashOut { user_id: UserId(3), reply: carol_tx })
            .unwrap();
        // Carol's slow credit runs past the crash deadline with alice queued behind
        handle
            .commands
            .try_send(EngineCommand::CashOut { user_id: UserId(1), reply: alice_tx })
            .unwrap();

        let carol = carol_rx.await.unwrap().unwrap();
        assert_eq!(carol.multiplier, Multiplier::from_hundredths(119));
        let alice = alice_rx.await.unwrap().unwrap();
        assert_eq!(alice.multiplier, Multiplier::from_hundredths(119));
        assert_eq!(alice.win_amount, Amount::from_units(119));
        assert!(Instant::now() > t0 + Duration::from_millis(8_900));

        sleep_until(t0 + Duration::from_millis(9_200)).await;
        let view = handle.get_state(Some(UserId(1))).await.unwrap();
        assert_eq!(view.phase, RoundPhase::Crashed);
        assert!(view.has_cashed_out);
        assert_eq!(wallet.balance(UserId(1)).await.unwrap(), Amount::from_units(1019));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_round_follows_cooldown() {
        let wallet = Arc::new(InMemoryWallet::new());
        let (runner, handle) = runner(&[DRAW_1_20], wallet);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let t0 = Instant::now();
        tokio::spawn(runner.run(shutdown_rx));

        sleep(Duration::from_millis(100)).await;
        let first = handle.get_state(None).await.unwrap().round_id.unwrap();

        // Crashes just before t0+9s, then 5s of cooldown
        sleep_until(t0 + Duration::from_millis(14_500)).await;
        let view = handle.get_state(None).await.unwrap();
        assert_eq!(view.phase, RoundPhase::Countdown);
        assert_ne!(view.round_id.unwrap(), first);

        let rounds = handle.recent_rounds(10).await.unwrap();
        assert_eq!(rounds.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_round_returns_snapshot() {
        let wallet = Arc::new(InMemoryWallet::with_opening_balance(Amount::from_units(100)));
        let (runner, handle) = runner(&[DRAW_1_20], wallet);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(runner.run(shutdown_rx));

        sleep(Duration::from_millis(100)).await;
        handle.place_bet(Bettor::new(1, "alice"), Amount::from_units(10)).await.unwrap();

        shutdown_tx.send(()).unwrap();
        let snapshot = task.await.unwrap().unwrap();
        assert_eq!(snapshot.bets.len(), 1);
        assert!(snapshot.bets[0].is_pending());

        assert_eq!(
            handle.place_bet(Bettor::new(2, "bob"), Amount::from_units(10)).await,
            Err(EngineError::EngineStopped)
        );
    }

    #[tokio::test]
    async fn test_stopped_engine_reports_stopped() {
        let (runner, handle) = runner(&[DRAW_1_20], Arc::new(InMemoryWallet::new()));
        drop(runner);
        assert_eq!(handle.get_state(None).await, Err(EngineError::EngineStopped));
        assert_eq!(handle.cash_out(UserId(1)).await, Err(EngineError::EngineStopped));
    }
}
