//! User profile and round history storage
//!
//! The engine only needs key lookups, upserts, counts and two sorted
//! queries, plus one atomic per-user adjustment. Balance changes never go
//! through a separate find-then-save, so concurrent bets and cashouts for the
//! same player cannot lose an update.

pub mod memory;
pub mod rocks;

use crate::game::types::{Credits, Round, User, UserUpdate};
use async_trait::async_trait;

pub use memory::MemoryStorage;
pub use rocks::RocksStorage;

/// Storage layer errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Credits, requested: Credits },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Round {0} already recorded")]
    RoundExists(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupted record {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl StoreError {
    /// Failures that may go away when the same write is retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage collaborator used by the game loop and the HTTP surface
#[async_trait]
pub trait Storage: Send + Sync {
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;

    /// Insert or replace a profile
    async fn save_user(&self, user: &User) -> StoreResult<()>;

    /// Return the profile, creating it with `starting_balance` on first contact
    async fn find_or_create_user(
        &self,
        user_id: &str,
        username: &str,
        starting_balance: Credits,
    ) -> StoreResult<User>;

    /// Atomic read-modify-write of one profile. Returns the updated profile.
    async fn adjust_user(&self, user_id: &str, update: &UserUpdate) -> StoreResult<User>;

    async fn count_users(&self) -> StoreResult<u64>;

    /// Players sorted by total winnings, highest first
    async fn top_users(&self, limit: usize) -> StoreResult<Vec<User>>;

    /// Record a sealed round. Rounds are insert-only.
    async fn save_round(&self, round: &Round) -> StoreResult<()>;

    async fn find_round(&self, round_id: &str) -> StoreResult<Option<Round>>;

    async fn count_rounds(&self) -> StoreResult<u64>;

    /// Sealed rounds, most recently ended first
    async fn recent_rounds(&self, limit: usize) -> StoreResult<Vec<Round>>;
}

/// Leaderboard order shared by the backends
pub(crate) fn sort_by_winnings(users: &mut Vec<User>, limit: usize) {
    users.sort_by(|a, b| {
        b.total_winnings
            .cmp(&a.total_winnings)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    users.truncate(limit);
}
