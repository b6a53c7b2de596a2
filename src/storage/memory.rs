//! In-process storage backend

use super::{sort_by_winnings, Storage, StoreError, StoreResult};
use crate::game::types::{Credits, Round, User, UserUpdate};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::RwLock;

/// Concurrent maps behind the [`Storage`] trait. Per-user atomicity comes
/// from the DashMap shard lock held across each adjustment.
#[derive(Default)]
pub struct MemoryStorage {
    users: DashMap<String, User>,
    /// Sealed rounds in insertion (crash) order
    rounds: RwLock<Vec<Round>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Database("round history lock poisoned".to_string())
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn save_user(&self, user: &User) -> StoreResult<()> {
        self.users.insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    async fn find_or_create_user(
        &self,
        user_id: &str,
        username: &str,
        starting_balance: Credits,
    ) -> StoreResult<User> {
        let user = match self.users.entry(user_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry
                .insert(User::new(user_id, username, starting_balance))
                .clone(),
        };
        Ok(user)
    }

    async fn adjust_user(&self, user_id: &str, update: &UserUpdate) -> StoreResult<User> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        entry.apply(update)?;
        Ok(entry.clone())
    }

    async fn count_users(&self) -> StoreResult<u64> {
        Ok(self.users.len() as u64)
    }

    async fn top_users(&self, limit: usize) -> StoreResult<Vec<User>> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.clone()).collect();
        sort_by_winnings(&mut users, limit);
        Ok(users)
    }

    async fn save_round(&self, round: &Round) -> StoreResult<()> {
        let mut rounds = self.rounds.write().map_err(|_| poisoned())?;
        if rounds.iter().any(|r| r.round_id == round.round_id) {
            return Err(StoreError::RoundExists(round.round_id.clone()));
        }
        rounds.push(round.clone());
        Ok(())
    }

    async fn find_round(&self, round_id: &str) -> StoreResult<Option<Round>> {
        let rounds = self.rounds.read().map_err(|_| poisoned())?;
        Ok(rounds.iter().find(|r| r.round_id == round_id).cloned())
    }

    async fn count_rounds(&self) -> StoreResult<u64> {
        let rounds = self.rounds.read().map_err(|_| poisoned())?;
        Ok(rounds.len() as u64)
    }

    async fn recent_rounds(&self, limit: usize) -> StoreResult<Vec<Round>> {
        let rounds = self.rounds.read().map_err(|_| poisoned())?;
        let mut recent: Vec<Round> = rounds.iter().rev().take(limit).cloned().collect();
        recent.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        Ok(recent)
    }
}
