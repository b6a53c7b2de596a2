//! RocksDB storage backend
//!
//! Key layout:
//! - `user:{id}` -> JSON profile
//! - `round:data:{id}` -> JSON sealed round
//! - `round:index:{inv_end_ms(be)}{id}` -> empty, newest-first scan order
//! - `meta:user_count`, `meta:round_count` -> u64 (le)

use super::{sort_by_winnings, Storage, StoreError, StoreResult};
use crate::game::types::{Credits, Round, User, UserUpdate};
use async_trait::async_trait;
use dashmap::DashMap;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

const USER_PREFIX: &[u8] = b"user:";
const ROUND_DATA_PREFIX: &[u8] = b"round:data:";
const ROUND_INDEX_PREFIX: &[u8] = b"round:index:";
const USER_COUNT_KEY: &[u8] = b"meta:user_count";
const ROUND_COUNT_KEY: &[u8] = b"meta:round_count";

fn user_key(user_id: &str) -> Vec<u8> {
    [USER_PREFIX, user_id.as_bytes()].concat()
}

fn round_data_key(round_id: &str) -> Vec<u8> {
    [ROUND_DATA_PREFIX, round_id.as_bytes()].concat()
}

fn round_index_key(round: &Round) -> Vec<u8> {
    // Newest first: invert the end time so lexicographic order is descending
    let end_ms = round
        .end_time
        .map(|t| t.timestamp_millis().max(0) as u64)
        .unwrap_or(0);
    let inv = u64::MAX - end_ms;
    let mut key = Vec::with_capacity(ROUND_INDEX_PREFIX.len() + 8 + round.round_id.len());
    key.extend_from_slice(ROUND_INDEX_PREFIX);
    key.extend_from_slice(&inv.to_be_bytes());
    key.extend_from_slice(round.round_id.as_bytes());
    key
}

/// Durable storage with per-user serialised read-modify-write
#[derive(Clone)]
pub struct RocksStorage {
    db: Arc<DB>,
    user_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Guards the counters and the round existence check
    meta_lock: Arc<Mutex<()>>,
}

impl RocksStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            user_locks: Arc::new(DashMap::new()),
            meta_lock: Arc::new(Mutex::new(())),
        })
    }

    fn batch_write<K, V>(&self, items: &[(K, V)]) -> StoreResult<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut batch = WriteBatch::default();
        for (key, value) in items {
            batch.put(key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        let Some(bytes) = self.db.get(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupted {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            })
    }

    fn encode<T: Serialize>(key: &[u8], value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::Corrupted {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }

    fn read_counter(&self, key: &[u8]) -> StoreResult<u64> {
        match self.db.get(key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupted {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: "counter is not 8 bytes".to_string(),
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Collect up to `limit` entries whose key starts with `prefix`
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn lock_poisoned() -> StoreError {
    StoreError::Database("storage lock poisoned".to_string())
}

#[async_trait]
impl Storage for RocksStorage {
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        self.get_json(&user_key(user_id))
    }

    async fn save_user(&self, user: &User) -> StoreResult<()> {
        let lock = self.lock_for(&user.user_id);
        let _guard = lock.lock().map_err(|_| lock_poisoned())?;
        let key = user_key(&user.user_id);
        let existed = self.db.get(&key)?.is_some();
        let bytes = Self::encode(&key, user)?;

        if existed {
            return self.batch_write(&[(key, bytes)]);
        }
        let _meta = self.meta_lock.lock().map_err(|_| lock_poisoned())?;
        let count = self.read_counter(USER_COUNT_KEY)? + 1;
        self.batch_write(&[
            (key, bytes),
            (USER_COUNT_KEY.to_vec(), count.to_le_bytes().to_vec()),
        ])
    }

    async fn find_or_create_user(
        &self,
        user_id: &str,
        username: &str,
        starting_balance: Credits,
    ) -> StoreResult<User> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().map_err(|_| lock_poisoned())?;
        let key = user_key(user_id);
        if let Some(user) = self.get_json::<User>(&key)? {
            return Ok(user);
        }

        let user = User::new(user_id, username, starting_balance);
        let bytes = Self::encode(&key, &user)?;
        let _meta = self.meta_lock.lock().map_err(|_| lock_poisoned())?;
        let count = self.read_counter(USER_COUNT_KEY)? + 1;
        self.batch_write(&[
            (key, bytes),
            (USER_COUNT_KEY.to_vec(), count.to_le_bytes().to_vec()),
        ])?;
        tracing::debug!(user_id, "Created player profile");
        Ok(user)
    }

    async fn adjust_user(&self, user_id: &str, update: &UserUpdate) -> StoreResult<User> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().map_err(|_| lock_poisoned())?;
        let key = user_key(user_id);
        let mut user: User = self
            .get_json(&key)?
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        user.apply(update)?;
        let bytes = Self::encode(&key, &user)?;
        self.batch_write(&[(key, bytes)])?;
        Ok(user)
    }

    async fn count_users(&self) -> StoreResult<u64> {
        self.read_counter(USER_COUNT_KEY)
    }

    async fn top_users(&self, limit: usize) -> StoreResult<Vec<User>> {
        let mut users = Vec::new();
        for (key, value) in self.scan_prefix(USER_PREFIX, usize::MAX)? {
            let user: User = serde_json::from_slice(&value).map_err(|e| StoreError::Corrupted {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            })?;
            users.push(user);
        }
        sort_by_winnings(&mut users, limit);
        Ok(users)
    }

    async fn save_round(&self, round: &Round) -> StoreResult<()> {
        let _meta = self.meta_lock.lock().map_err(|_| lock_poisoned())?;
        let data_key = round_data_key(&round.round_id);
        if self.db.get(&data_key)?.is_some() {
            return Err(StoreError::RoundExists(round.round_id.clone()));
        }
        let bytes = Self::encode(&data_key, round)?;
        let count = self.read_counter(ROUND_COUNT_KEY)? + 1;
        self.batch_write(&[
            (data_key, bytes),
            (round_index_key(round), Vec::new()),
            (ROUND_COUNT_KEY.to_vec(), count.to_le_bytes().to_vec()),
        ])
    }

    async fn find_round(&self, round_id: &str) -> StoreResult<Option<Round>> {
        self.get_json(&round_data_key(round_id))
    }

    async fn count_rounds(&self) -> StoreResult<u64> {
        self.read_counter(ROUND_COUNT_KEY)
    }

    async fn recent_rounds(&self, limit: usize) -> StoreResult<Vec<Round>> {
        let mut rounds = Vec::with_capacity(limit);
        for (key, _) in self.scan_prefix(ROUND_INDEX_PREFIX, limit)? {
            let id_offset = ROUND_INDEX_PREFIX.len() + 8;
            if key.len() <= id_offset {
                continue;
            }
            let round_id = String::from_utf8_lossy(&key[id_offset..]).into_owned();
            if let Some(round) = self.get_json::<Round>(&round_data_key(&round_id))? {
                rounds.push(round);
            }
        }
        Ok(rounds)
    }
}
