//! Background persistence queue
//!
//! The flight tick must never wait on storage. Credits, loss counters and
//! sealed rounds are queued here and written in submission order by a single
//! worker. Callers that need the outcome (a manual cashout reporting the new
//! balance) attach a oneshot acknowledgement.
//!
//! Credits for settled bets are never dropped. When the normal retries run
//! out, the acknowledgement reports the failure and the credit moves to a
//! redelivery task that keeps trying until storage accepts it.

use crate::game::types::{Round, User, UserUpdate};
use crate::metrics::GameMetrics;
use crate::storage::{Storage, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Attempts for a write that fails with a retryable error
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Ceiling for the redelivery backoff of an owed credit
const MAX_REDELIVERY_BACKOFF: Duration = Duration::from_secs(5);

/// Write handed to the worker
pub enum PersistJob {
    Adjust {
        user_id: String,
        update: UserUpdate,
        ack: Option<oneshot::Sender<StoreResult<User>>>,
    },
    SaveRound {
        round: Round,
    },
}

/// Sender side of the queue
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl PersistenceQueue {
    /// Spawn the worker task and return the queue feeding it
    pub fn spawn(storage: Arc<dyn Storage>, metrics: Arc<GameMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, storage, metrics));
        Self { tx }
    }

    /// Queue a profile change without waiting for it
    pub fn adjust(&self, user_id: String, update: UserUpdate) {
        self.submit(PersistJob::Adjust {
            user_id,
            update,
            ack: None,
        });
    }

    /// Queue a profile change; the receiver resolves once it is written
    pub fn adjust_with_ack(
        &self,
        user_id: String,
        update: UserUpdate,
    ) -> oneshot::Receiver<StoreResult<User>> {
        let (ack, rx) = oneshot::channel();
        self.submit(PersistJob::Adjust {
            user_id,
            update,
            ack: Some(ack),
        });
        rx
    }

    pub fn save_round(&self, round: Round) {
        self.submit(PersistJob::SaveRound { round });
    }

    fn submit(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            error!("Persistence worker stopped; dropping write");
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
    storage: Arc<dyn Storage>,
    metrics: Arc<GameMetrics>,
) {
    debug!("Persistence worker started");
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Adjust {
                user_id,
                update,
                ack,
            } => {
                let result = with_retry(|| storage.adjust_user(&user_id, &update)).await;
                let failed = match &result {
                    Ok(_) => false,
                    Err(e) => {
                        metrics.persistence_failures.inc();
                        error!(user_id = %user_id, ?update, "Failed to apply profile update: {}", e);
                        true
                    }
                };
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
                if failed && update.is_credit() {
                    tokio::spawn(redeliver(storage.clone(), user_id, update));
                }
            }
            PersistJob::SaveRound { round } => {
                let result = with_retry(|| storage.save_round(&round)).await;
                match result {
                    Ok(()) => debug!(round_id = %round.round_id, "Round sealed to history"),
                    Err(e) => {
                        metrics.persistence_failures.inc();
                        error!(round_id = %round.round_id, "Failed to persist round: {}", e);
                    }
                }
            }
        }
    }
    debug!("Persistence worker stopped");
}

async fn with_retry<T, F, Fut>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!("Storage write failed (attempt {}/{}): {}", attempt, MAX_ATTEMPTS, e);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Keep applying an owed credit until storage accepts it
async fn redeliver(storage: Arc<dyn Storage>, user_id: String, update: UserUpdate) {
    warn!(user_id = %user_id, ?update, "Credit queued for redelivery");
    let mut attempt: u32 = 1;
    loop {
        tokio::time::sleep((RETRY_BACKOFF * attempt).min(MAX_REDELIVERY_BACKOFF)).await;
        match storage.adjust_user(&user_id, &update).await {
            Ok(user) => {
                info!(user_id = %user_id, balance = %user.balance, attempt, "Credit redelivered");
                return;
            }
            Err(e) => {
                warn!(user_id = %user_id, attempt, "Credit redelivery failed: {}", e);
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
