//! End-to-end rounds through the game loop task, on a paused clock

use async_trait::async_trait;
use crashpoint::config::GameConfig;
use crashpoint::game::{
    BetStatus, Credits, EventBus, GameEvent, GameHandle, GameRunner, Multiplier, Round,
    RoundEngine, User, UserUpdate,
};
use crashpoint::metrics::GameMetrics;
use crashpoint::storage::{MemoryStorage, Storage, StoreError, StoreResult};
use crashpoint::GameError;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Memory storage with injectable latency and failures
#[derive(Default)]
struct TestStorage {
    inner: MemoryStorage,
    /// Debits for this user sleep before they are applied
    slow_debits: Option<(String, Duration)>,
    /// Cashout credits still to reject with a database error
    failing_cashouts: AtomicU32,
}

impl TestStorage {
    fn with_slow_debits(user_id: &str, delay: Duration) -> Self {
        Self {
            slow_debits: Some((user_id.to_string(), delay)),
            ..Default::default()
        }
    }

    fn with_failing_cashouts(count: u32) -> Self {
        Self {
            failing_cashouts: AtomicU32::new(count),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Storage for TestStorage {
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        self.inner.find_user(user_id).await
    }
    async fn save_user(&self, user: &User) -> StoreResult<()> {
        self.inner.save_user(user).await
    }
    async fn find_or_create_user(
        &self,
        user_id: &str,
        username: &str,
        starting_balance: Credits,
    ) -> StoreResult<User> {
        self.inner
            .find_or_create_user(user_id, username, starting_balance)
            .await
    }
    async fn adjust_user(&self, user_id: &str, update: &UserUpdate) -> StoreResult<User> {
        match update {
            UserUpdate::Debit { .. } => {
                if let Some((slow_user, delay)) = &self.slow_debits {
                    if slow_user == user_id {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
            UserUpdate::Cashout { .. } => {
                let failing = self
                    .failing_cashouts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(StoreError::Database("down".to_string()));
                }
            }
            UserUpdate::Loss { .. } | UserUpdate::Refund { .. } => {}
        }
        self.inner.adjust_user(user_id, update).await
    }
    async fn count_users(&self) -> StoreResult<u64> {
        self.inner.count_users().await
    }
    async fn top_users(&self, limit: usize) -> StoreResult<Vec<User>> {
        self.inner.top_users(limit).await
    }
    async fn save_round(&self, round: &Round) -> StoreResult<()> {
        self.inner.save_round(round).await
    }
    async fn find_round(&self, round_id: &str) -> StoreResult<Option<Round>> {
        self.inner.find_round(round_id).await
    }
    async fn count_rounds(&self) -> StoreResult<u64> {
        self.inner.count_rounds().await
    }
    async fn recent_rounds(&self, limit: usize) -> StoreResult<Vec<Round>> {
        self.inner.recent_rounds(limit).await
    }
}

struct Harness {
    game: GameHandle,
    events: broadcast::Receiver<GameEvent>,
    storage: Arc<TestStorage>,
    metrics: Arc<GameMetrics>,
}

/// Loop whose first round crashes at `crash_point`, with player "1"
/// holding the 0.09 starting balance
async fn start(crash_point: f64) -> Harness {
    start_with(TestStorage::default(), crash_point).await
}

async fn start_with(storage: TestStorage, crash_point: f64) -> Harness {
    let storage = Arc::new(storage);
    storage
        .find_or_create_user("1", "alice", Credits::from_units(0.09).unwrap())
        .await
        .unwrap();

    let mut engine = RoundEngine::with_rng(GameConfig::default(), StdRng::seed_from_u64(11));
    engine.set_next_crash(crash_point).unwrap();

    let bus = EventBus::new(8_192);
    let events = bus.subscribe();
    let metrics = Arc::new(GameMetrics::new().unwrap());
    let (runner, game) = GameRunner::new(engine, storage.clone(), bus, metrics.clone());
    runner.spawn();

    Harness {
        game,
        events,
        storage,
        metrics,
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<GameEvent>,
    mut matches: impl FnMut(&GameEvent) -> bool,
) -> GameEvent {
    loop {
        let event = events.recv().await.expect("event stream closed");
        if matches(&event) {
            return event;
        }
    }
}

fn at(multiplier: u32) -> impl FnMut(&GameEvent) -> bool {
    move |e| matches!(e, GameEvent::MultiplierUpdate { multiplier: m } if *m == Multiplier(multiplier))
}

fn crashed(e: &GameEvent) -> bool {
    matches!(e, GameEvent::GameCrashed { .. })
}

/// Let the persistence worker drain
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_cashout_round() {
    let mut h = start(2.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;

    let receipt = h.game.place_bet("1", "alice", 0.05, None).await.unwrap();
    assert_eq!(receipt.new_balance, Credits::from_units(0.04).unwrap());
    wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::NewBet { username, amount } if username == "alice" && *amount == Credits(50_000))
    })
    .await;

    wait_for(&mut h.events, at(150)).await;
    let outcome = h.game.cashout("1").await.unwrap();
    assert_eq!(outcome.multiplier, Multiplier(150));
    assert_eq!(outcome.win_amount, Credits::from_units(0.075).unwrap());
    assert_eq!(outcome.new_balance, Some(Credits::from_units(0.115).unwrap()));

    let again = h.game.cashout("1").await;
    assert_eq!(again.unwrap_err(), GameError::already_settled());

    let event = wait_for(&mut h.events, crashed).await;
    assert!(matches!(event, GameEvent::GameCrashed { crash_point, .. } if crash_point == Multiplier(200)));
    settle().await;

    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.115).unwrap());
    assert_eq!(user.games_played, 1);
    assert_eq!(user.games_won, 1);
    assert_eq!(user.total_winnings, Credits::from_units(0.025).unwrap());
    assert_eq!(user.bets_history.len(), 1);

    let rounds = h.storage.recent_rounds(20).await.unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].round_id, receipt.round_id);
    assert_eq!(rounds[0].bets[0].status, BetStatus::CashedOut);
    assert_eq!(rounds[0].bets[0].cashout_multiplier, Some(Multiplier(150)));
}

#[tokio::test(start_paused = true)]
async fn test_uncashed_bet_loses_at_crash() {
    let mut h = start(2.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;

    h.game.place_bet("1", "alice", 0.05, None).await.unwrap();
    wait_for(&mut h.events, crashed).await;
    settle().await;

    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.04).unwrap());
    assert_eq!(user.games_played, 1);
    assert_eq!(user.games_won, 0);
    assert_eq!(user.bets_history[0].status, BetStatus::Lost);

    let rounds = h.storage.recent_rounds(20).await.unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].bets[0].status, BetStatus::Lost);
    assert_eq!(h.metrics.losses_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auto_cashout_pays_at_target() {
    let mut h = start(3.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;

    h.game.place_bet("1", "alice", 0.05, Some(1.5)).await.unwrap();
    let event = wait_for(&mut h.events, |e| matches!(e, GameEvent::PlayerCashedOut { .. })).await;
    assert_eq!(
        event,
        GameEvent::PlayerCashedOut {
            username: "alice".into(),
            multiplier: Multiplier(150),
            win_amount: Credits(75_000),
        }
    );

    let manual = h.game.cashout("1").await;
    assert_eq!(manual.unwrap_err(), GameError::already_settled());

    wait_for(&mut h.events, crashed).await;
    settle().await;
    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.115).unwrap());
    assert_eq!(user.games_won, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_bets_never_overdraw() {
    let mut h = start(2.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;

    let bets = (0..5).map(|_| {
        let game = h.game.clone();
        async move { game.place_bet("1", "alice", 0.02, None).await }
    });
    let results = futures::future::join_all(bets).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 4);
    assert!(results
        .iter()
        .any(|r| r.as_ref().err() == Some(&GameError::insufficient_funds())));

    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.01).unwrap());
    assert_eq!(h.game.snapshot().await.unwrap().bets.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_betting_closed_during_flight() {
    let mut h = start(5.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameStarted { .. })).await;

    let err = h.game.place_bet("1", "alice", 0.01, None).await.unwrap_err();
    assert_eq!(err, GameError::betting_closed());
    let err = h.game.place_bet("1", "alice", -1.0, None).await.unwrap_err();
    assert_eq!(err, GameError::betting_closed());

    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.09).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_bets_leave_balance_untouched() {
    let mut h = start(2.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;

    for (amount, auto) in [(0.0, None), (0.01, Some(1.0)), (0.5, None)] {
        assert!(matches!(
            h.game.place_bet("1", "alice", amount, auto).await,
            Err(GameError::Validation(_))
        ));
    }
    assert!(matches!(
        h.game.place_bet("nobody", "ghost", 0.01, None).await,
        Err(GameError::Validation(_))
    ));

    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.09).unwrap());
    assert!(h.game.snapshot().await.unwrap().bets.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_force_crash_and_next_round() {
    let mut h = start(50.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;
    h.game.place_bet("1", "alice", 0.05, Some(10.0)).await.unwrap();

    wait_for(&mut h.events, at(123)).await;
    assert_eq!(h.game.force_crash().await.unwrap(), Multiplier(123));
    let event = wait_for(&mut h.events, crashed).await;
    assert!(matches!(event, GameEvent::GameCrashed { crash_point, .. } if crash_point == Multiplier(123)));

    assert!(matches!(h.game.force_crash().await, Err(GameError::PhaseViolation(_))));

    // Override for the following round, then let it play out
    assert_eq!(h.game.set_next_crash(1.1).await.unwrap(), Multiplier(110));
    let view = h.game.admin_view().await.unwrap();
    assert_eq!(view.pending_override, Some(Multiplier(110)));

    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;
    let event = wait_for(&mut h.events, crashed).await;
    assert!(matches!(event, GameEvent::GameCrashed { crash_point, .. } if crash_point == Multiplier(110)));
    settle().await;

    let rounds = h.storage.recent_rounds(20).await.unwrap();
    assert_eq!(rounds.len(), 2);
    assert!(rounds.iter().all(|r| r.admin_controlled));
    assert_eq!(rounds[1].crash_point, Multiplier(123));
    assert_eq!(rounds[1].bets[0].status, BetStatus::Lost);
    assert_eq!(h.metrics.rounds_total.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_never_reveals_crash_point() {
    let mut h = start(77.77).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameStarted { .. })).await;

    let snapshot = h.game.snapshot().await.unwrap();
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(!json.contains("crashPoint"));
    assert!(!json.contains("77.77"));

    let view = h.game.admin_view().await.unwrap();
    assert_eq!(view.crash_point, Some(Multiplier(7_777)));
}

#[tokio::test(start_paused = true)]
async fn test_slow_debit_does_not_hold_up_the_round() {
    let mut h = start_with(
        TestStorage::with_slow_debits("slow", Duration::from_secs(2)),
        2.0,
    )
    .await;
    h.storage
        .find_or_create_user("slow", "sloth", Credits::from_units(0.09).unwrap())
        .await
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;
    let opened = Instant::now();

    let slow_game = h.game.clone();
    let slow_bet =
        tokio::spawn(async move { slow_game.place_bet("slow", "sloth", 0.01, None).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let sent = Instant::now();
    let receipt = h.game.place_bet("1", "alice", 0.05, None).await.unwrap();
    assert!(sent.elapsed() < Duration::from_millis(10));
    assert_eq!(receipt.new_balance, Credits::from_units(0.04).unwrap());

    wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::CountdownTick { countdown } if *countdown == 7)
    })
    .await;
    let elapsed = opened.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3_010));

    let slow_receipt = slow_bet.await.unwrap().unwrap();
    assert_eq!(slow_receipt.round_id, receipt.round_id);
    assert_eq!(h.game.snapshot().await.unwrap().bets.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_debit_outlasting_betting_window_is_refunded() {
    let mut h = start_with(
        TestStorage::with_slow_debits("1", Duration::from_secs(2)),
        5.0,
    )
    .await;
    wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::CountdownTick { countdown } if *countdown == 1)
    })
    .await;

    let err = h.game.place_bet("1", "alice", 0.05, None).await.unwrap_err();
    assert_eq!(err, GameError::betting_closed());
    settle().await;

    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.09).unwrap());
    assert!(h.game.snapshot().await.unwrap().bets.is_empty());
    assert_eq!(h.metrics.bets_total.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_cashout_credit_still_lands() {
    let mut h = start_with(TestStorage::with_failing_cashouts(5), 3.0).await;
    wait_for(&mut h.events, |e| matches!(e, GameEvent::GameWaiting { .. })).await;
    h.game.place_bet("1", "alice", 0.05, None).await.unwrap();

    wait_for(&mut h.events, at(150)).await;
    let outcome = h.game.cashout("1").await.unwrap();
    assert_eq!(outcome.win_amount, Credits::from_units(0.075).unwrap());
    assert_eq!(outcome.new_balance, None);
    assert_eq!(
        h.game.cashout("1").await.unwrap_err(),
        GameError::already_settled()
    );
    assert_eq!(h.metrics.persistence_failures.get(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let user = h.storage.find_user("1").await.unwrap().unwrap();
    assert_eq!(user.balance, Credits::from_units(0.115).unwrap());
    assert_eq!(user.games_won, 1);
    assert_eq!(user.total_winnings, Credits::from_units(0.025).unwrap());
}
