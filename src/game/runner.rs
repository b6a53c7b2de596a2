//! Game loop task
//!
//! One task owns the [`RoundEngine`] and is its only writer. Timer ticks and
//! queued commands are multiplexed with a biased `select!` so a tick that is
//! due always runs before any command queued behind it. The loop never
//! awaits storage: stakes are debited by the caller before the bet reaches
//! the loop, and every other write goes through the persistence queue.

use crate::errors::{GameError, GameResult};
use crate::game::engine::{AdminRoundView, Effect, RoundEngine, RoundSnapshot};
use crate::game::events::{EventBus, GameEvent};
use crate::game::ledger::{validate_stake, StakeRequest};
use crate::game::persistence::PersistenceQueue;
use crate::game::types::{Credits, Multiplier, User, UserUpdate};
use crate::metrics::GameMetrics;
use crate::storage::{Storage, StoreResult};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Request handled by the game loop
pub enum Command {
    /// Id of the round taking bets, if any
    BettingRound {
        reply: oneshot::Sender<GameResult<String>>,
    },
    /// Add a bet whose stake is already debited. Refunded by the loop when
    /// `round_id` is no longer taking bets.
    AcceptBet {
        round_id: String,
        user_id: String,
        username: String,
        stake: StakeRequest,
        reply: oneshot::Sender<GameResult<()>>,
    },
    Cashout {
        user_id: String,
        reply: oneshot::Sender<GameResult<CashoutReceipt>>,
    },
    SetNextCrash {
        crash_point: f64,
        reply: oneshot::Sender<GameResult<Multiplier>>,
    },
    ForceCrash {
        reply: oneshot::Sender<GameResult<Multiplier>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoundSnapshot>,
    },
    /// Snapshot plus an event receiver that starts right after it
    Subscribe {
        reply: oneshot::Sender<(RoundSnapshot, broadcast::Receiver<GameEvent>)>,
    },
    AdminView {
        reply: oneshot::Sender<AdminRoundView>,
    },
    #[cfg(test)]
    Fail,
}

/// Accepted bet
#[derive(Debug, Clone, PartialEq)]
pub struct BetReceipt {
    pub round_id: String,
    pub amount: Credits,
    pub new_balance: Credits,
}

/// Settled cashout whose credit is still being written
#[derive(Debug)]
pub struct CashoutReceipt {
    pub multiplier: Multiplier,
    pub win_amount: Credits,
    pub balance: oneshot::Receiver<StoreResult<User>>,
}

/// Settled cashout. `new_balance` is `None` while the credit is still
/// being redelivered.
#[derive(Debug, Clone, PartialEq)]
pub struct CashoutOutcome {
    pub multiplier: Multiplier,
    pub win_amount: Credits,
    pub new_balance: Option<Credits>,
}

/// Cloneable front door to the game loop
#[derive(Clone)]
pub struct GameHandle {
    tx: mpsc::Sender<Command>,
    storage: Arc<dyn Storage>,
    persistence: PersistenceQueue,
}

impl GameHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> GameResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| GameError::Unavailable)?;
        rx.await.map_err(|_| GameError::Unavailable)
    }

    /// Debit the stake and join the round taking bets.
    ///
    /// The debit runs on the caller's task. If the betting window closed
    /// while it was in flight, the stake is refunded.
    pub async fn place_bet(
        &self,
        user_id: &str,
        username: &str,
        amount: f64,
        auto_cashout: Option<f64>,
    ) -> GameResult<BetReceipt> {
        let round_id = self
            .request(|reply| Command::BettingRound { reply })
            .await??;
        let stake = validate_stake(amount, auto_cashout)?;

        let user = self
            .storage
            .adjust_user(user_id, &UserUpdate::Debit { amount: stake.amount })
            .await?;

        let accepted = self
            .request(|reply| Command::AcceptBet {
                round_id: round_id.clone(),
                user_id: user_id.to_string(),
                username: username.to_string(),
                stake,
                reply,
            })
            .await;

        match accepted {
            Ok(Ok(())) => Ok(BetReceipt {
                round_id,
                amount: stake.amount,
                new_balance: user.balance,
            }),
            // The loop has already queued the refund
            Ok(Err(e)) => Err(e),
            Err(e) => {
                self.persistence.adjust(
                    user_id.to_string(),
                    UserUpdate::Refund {
                        round_id,
                        stake: stake.amount,
                    },
                );
                Err(e)
            }
        }
    }

    /// Cash out and wait until the payout is credited. A settled cashout
    /// is never reported as failed; if the credit could not be written yet
    /// the balance is left unknown.
    pub async fn cashout(&self, user_id: &str) -> GameResult<CashoutOutcome> {
        let receipt = self
            .request(|reply| Command::Cashout {
                user_id: user_id.to_string(),
                reply,
            })
            .await??;

        let new_balance = match receipt.balance.await {
            Ok(Ok(user)) => Some(user.balance),
            Ok(Err(e)) => {
                warn!(user_id = %user_id, "Cashout credit pending: {}", e);
                None
            }
            Err(_) => {
                warn!(user_id = %user_id, "Cashout credit pending: no acknowledgement");
                None
            }
        };
        Ok(CashoutOutcome {
            multiplier: receipt.multiplier,
            win_amount: receipt.win_amount,
            new_balance,
        })
    }

    pub async fn set_next_crash(&self, crash_point: f64) -> GameResult<Multiplier> {
        self.request(|reply| Command::SetNextCrash { crash_point, reply })
            .await?
    }

    /// Crash the round in flight. Returns the crash multiplier.
    pub async fn force_crash(&self) -> GameResult<Multiplier> {
        self.request(|reply| Command::ForceCrash { reply }).await?
    }

    pub async fn snapshot(&self) -> GameResult<RoundSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Current state and the events that follow it, with nothing older
    /// than the snapshot in the receiver
    pub async fn subscribe(&self) -> GameResult<(RoundSnapshot, broadcast::Receiver<GameEvent>)> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    pub async fn admin_view(&self) -> GameResult<AdminRoundView> {
        self.request(|reply| Command::AdminView { reply }).await
    }
}

pub struct GameRunner {
    engine: RoundEngine,
    commands: mpsc::Receiver<Command>,
    persistence: PersistenceQueue,
    bus: EventBus,
    metrics: Arc<GameMetrics>,
}

impl GameRunner {
    /// Wire the loop to its collaborators. Starts the persistence worker, so
    /// it must be called inside a Tokio runtime.
    pub fn new(
        engine: RoundEngine,
        storage: Arc<dyn Storage>,
        bus: EventBus,
        metrics: Arc<GameMetrics>,
    ) -> (Self, GameHandle) {
        let (tx, commands) = mpsc::channel(engine.config().command_buffer.max(1));
        let persistence = PersistenceQueue::spawn(storage.clone(), metrics.clone());
        let handle = GameHandle {
            tx,
            storage,
            persistence: persistence.clone(),
        };
        let runner = Self {
            engine,
            commands,
            persistence,
            bus,
            metrics,
        };
        (runner, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every [`GameHandle`] is dropped. A panic while driving a
    /// round aborts that round and refunds its open bets, then play resumes
    /// with a fresh round.
    pub async fn run(mut self) {
        info!("Game loop started");
        loop {
            match AssertUnwindSafe(self.drive()).catch_unwind().await {
                Ok(()) => break,
                Err(panic) => {
                    error!("Game loop failed: {}", panic_message(panic.as_ref()));
                    self.metrics.loop_restarts_total.inc();
                    let refunds = self.engine.abort_round();
                    self.apply(refunds);
                }
            }
        }
        info!("Game loop stopped");
    }

    async fn drive(&mut self) {
        let mut deadline = Instant::now() + self.engine.next_delay();
        loop {
            tokio::select! {
                biased;

                _ = sleep_until(deadline) => {
                    let effects = self.engine.advance();
                    self.apply(effects);
                    deadline += self.engine.next_delay();
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return;
                    };
                    if self.handle(command) {
                        deadline = Instant::now() + self.engine.next_delay();
                    }
                }
            }
        }
    }

    /// Execute one command. Returns true when the phase timer must restart.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::BettingRound { reply } => {
                let round_id = self.engine.betting_round().map(str::to_string);
                let _ = reply.send(round_id);
                false
            }
            Command::AcceptBet {
                round_id,
                user_id,
                username,
                stake,
                reply,
            } => {
                self.accept_bet(round_id, user_id, username, stake, reply);
                false
            }
            Command::Cashout { user_id, reply } => {
                let _ = reply.send(self.cashout(&user_id));
                false
            }
            Command::SetNextCrash { crash_point, reply } => {
                let _ = reply.send(self.engine.set_next_crash(crash_point));
                false
            }
            Command::ForceCrash { reply } => match self.engine.force_crash() {
                Ok(effects) => {
                    let crashed_at = self.engine.multiplier();
                    self.apply(effects);
                    let _ = reply.send(Ok(crashed_at));
                    true
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    false
                }
            },
            Command::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
                false
            }
            Command::Subscribe { reply } => {
                let events = self.bus.subscribe();
                let _ = reply.send((self.engine.snapshot(), events));
                false
            }
            Command::AdminView { reply } => {
                let _ = reply.send(self.engine.admin_view());
                false
            }
            #[cfg(test)]
            Command::Fail => panic!("injected loop failure"),
        }
    }

    fn accept_bet(
        &mut self,
        round_id: String,
        user_id: String,
        username: String,
        stake: StakeRequest,
        reply: oneshot::Sender<GameResult<()>>,
    ) {
        let still_open = self
            .engine
            .betting_round()
            .map_or(false, |current| current == round_id);
        let accepted = if still_open {
            self.engine.accept_bet(&user_id, &username, stake)
        } else {
            Err(GameError::betting_closed())
        };

        match accepted {
            Ok(effects) => {
                self.metrics.bets_total.inc();
                self.metrics.wagered_credits_total.inc_by(stake.amount.0);
                debug!(round_id = %round_id, user_id = %user_id, "Bet of {} accepted", stake.amount);
                let _ = reply.send(Ok(()));
                self.apply(effects);
            }
            Err(e) => {
                debug!(round_id = %round_id, user_id = %user_id, "Bet refused after debit: {}", e);
                self.persistence.adjust(
                    user_id,
                    UserUpdate::Refund {
                        round_id,
                        stake: stake.amount,
                    },
                );
                let _ = reply.send(Err(e));
            }
        }
    }

    fn cashout(&mut self, user_id: &str) -> GameResult<CashoutReceipt> {
        let (settled, effects) = self.engine.cashout(user_id)?;
        self.metrics.cashouts_total.inc();
        self.metrics.paid_out_credits_total.inc_by(settled.payout.0);

        let balance = self
            .persistence
            .adjust_with_ack(settled.user_id.clone(), settled.user_update());
        self.apply(effects);

        Ok(CashoutReceipt {
            multiplier: settled.multiplier,
            win_amount: settled.payout,
            balance,
        })
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => self.bus.publish(event),
                Effect::Persist { user_id, update } => {
                    match &update {
                        UserUpdate::Cashout { payout, .. } => {
                            self.metrics.cashouts_total.inc();
                            self.metrics.paid_out_credits_total.inc_by(payout.0);
                        }
                        UserUpdate::Loss { .. } => self.metrics.losses_total.inc(),
                        UserUpdate::Debit { .. } | UserUpdate::Refund { .. } => {}
                    }
                    self.persistence.adjust(user_id, update);
                }
                Effect::SealRound(round) => {
                    self.metrics.rounds_total.inc();
                    self.metrics.crash_points.observe(round.crash_point.as_f64());
                    self.persistence.save_round(round);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::types::Phase;
    use crate::storage::MemoryStorage;
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;

    async fn start(storage: Arc<dyn Storage>, crash_point: f64) -> (GameHandle, EventBus) {
        let mut engine = RoundEngine::with_rng(GameConfig::default(), StdRng::seed_from_u64(3));
        engine.set_next_crash(crash_point).unwrap();
        let bus = EventBus::new(4_096);
        let metrics = Arc::new(GameMetrics::new().unwrap());
        let (runner, handle) = GameRunner::new(engine, storage, bus.clone(), metrics);
        runner.spawn();
        (handle, bus)
    }

    async fn seeded(balance: Credits) -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .find_or_create_user("1", "alice", balance)
            .await
            .unwrap();
        storage
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_refunds_open_bets() {
        let storage = seeded(Credits(90_000)).await;
        let (game, bus) = start(storage.clone(), 2.0).await;
        let mut events = bus.subscribe();

        let receipt = game.place_bet("1", "alice", 0.05, None).await.unwrap();
        assert_eq!(receipt.new_balance, Credits(40_000));

        game.tx.send(Command::Fail).await.unwrap();

        // The aborted round is replaced by a fresh betting window
        let snapshot = game.snapshot().await.unwrap();
        assert!(snapshot.status.accepts_bets());
        assert_ne!(snapshot.round_id.as_deref(), Some(receipt.round_id.as_str()));
        assert!(snapshot.bets.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let alice = storage.find_user("1").await.unwrap().unwrap();
        assert_eq!(alice.balance, Credits(90_000));
        assert_eq!(storage.count_rounds().await.unwrap(), 0);

        let mut reopened = false;
        while let Ok(event) = events.try_recv() {
            if let GameEvent::GameWaiting { round_id, .. } = event {
                reopened |= round_id != receipt.round_id;
            }
        }
        assert!(reopened);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bet_for_stale_round_is_refunded() {
        // Balance as it stands after a 0.05 debit
        let storage = seeded(Credits(40_000)).await;
        let (game, _bus) = start(storage.clone(), 2.0).await;

        let stake = validate_stake(0.05, None).unwrap();
        let accepted = game
            .request(|reply| Command::AcceptBet {
                round_id: "stale".into(),
                user_id: "1".into(),
                username: "alice".into(),
                stake,
                reply,
            })
            .await
            .unwrap();
        assert_eq!(accepted, Err(GameError::betting_closed()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let alice = storage.find_user("1").await.unwrap().unwrap();
        assert_eq!(alice.balance, Credits(90_000));
        assert!(game.snapshot().await.unwrap().bets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_starts_after_snapshot() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (game, bus) = start(storage, 5.0).await;
        let mut events = bus.subscribe();
        while !matches!(events.recv().await.unwrap(), GameEvent::GameStarted { .. }) {}
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (snapshot, mut rx) = game.subscribe().await.unwrap();
        assert_eq!(snapshot.status, Phase::Flying);
        assert!(snapshot.multiplier > Multiplier::ONE);

        let step = GameConfig::default().tick_step_hundredths;
        assert_eq!(
            rx.recv().await.unwrap(),
            GameEvent::MultiplierUpdate {
                multiplier: snapshot.multiplier.step(step)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_crash_outside_flight_is_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (game, _bus) = start(storage, 2.0).await;

        let err = game.force_crash().await.unwrap_err();
        assert!(matches!(err, GameError::PhaseViolation(_)));
        assert_eq!(game.admin_view().await.unwrap().bets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_reports_stopped_loop() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let engine = RoundEngine::with_rng(GameConfig::default(), StdRng::seed_from_u64(1));
        let metrics = Arc::new(GameMetrics::new().unwrap());
        let (runner, handle) = GameRunner::new(engine, storage, EventBus::new(8), metrics);
        drop(runner);

        assert_eq!(handle.snapshot().await.unwrap_err(), GameError::Unavailable);
    }
}
