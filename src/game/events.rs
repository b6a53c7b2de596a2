//! Round events fanned out to every observer
//!
//! The game loop publishes; each WebSocket connection holds a receiver.
//! Nothing published here may carry the crash point of a round that has not
//! crashed yet.

use crate::game::types::{Credits, Multiplier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast event, tagged by `type` on the wire
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GameEvent {
    /// Betting window opened for a new round
    GameWaiting { round_id: String, countdown: u32 },

    /// One second of the betting window elapsed
    CountdownTick { countdown: u32 },

    /// Flight started at 1.00x
    GameStarted {
        round_id: String,
        start_time: DateTime<Utc>,
    },

    MultiplierUpdate { multiplier: Multiplier },

    PlayerCashedOut {
        username: String,
        multiplier: Multiplier,
        win_amount: Credits,
    },

    /// Round over. First moment the crash point is revealed.
    GameCrashed {
        crash_point: Multiplier,
        round_id: String,
    },

    /// A bet joined the round. Carries no balance information.
    NewBet { username: String, amount: Credits },

    PlayersUpdate { count: u64 },
}

/// Broadcast channel plus the live observer count
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GameEvent>,
    observers: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: GameEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("No observers for event: {:?}", e.0);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }

    /// Register an observer and announce the new count
    pub fn observer_connected(&self) -> u64 {
        let count = self.observers.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(GameEvent::PlayersUpdate { count });
        count
    }

    /// Deregister an observer and announce the new count
    pub fn observer_disconnected(&self) -> u64 {
        let count = self
            .observers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        self.publish(GameEvent::PlayersUpdate { count });
        count
    }

    pub fn observer_count(&self) -> u64 {
        self.observers.load(Ordering::SeqCst)
    }
}
