//! Durable per-account queue of mutations awaiting replay.
//!
//! Every change is written to the storage backend before the call returns,
//! so an enqueued mutation survives a crash. Replay itself is driven by
//! [`QueueDrainer`](super::QueueDrainer).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

use super::{AccountQueue, Invalidation, MutationEvent, MutationStatus, QueuedMutation};
use crate::api::Operation;
use crate::auth::Did;
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::storage::StorageBackend;

/// Storage key prefix for account queues
const QUEUE_PREFIX: &str = "queue/";

/// Capacity of the mutation event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn storage_key(did: &Did) -> String {
    format!("{}{}", QUEUE_PREFIX, did)
}

/// How an attempt ended, as recorded by the drainer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    Confirmed,
    /// Back to pending. `refund` un-counts the attempt (it never reached a
    /// verdict from the service).
    Pending { error: Option<String>, refund: bool },
    Failed(String),
}

struct QueueInner {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    /// Held across storage writes only, never across network calls.
    queues: Mutex<HashMap<Did, AccountQueue>>,
    events: broadcast::Sender<MutationEvent>,
    wake: Notify,
}

#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    /// Load persisted queues. Attempts interrupted by a crash go back to
    /// pending.
    pub async fn open(storage: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let mut queues = HashMap::new();
        for key in storage.list(QUEUE_PREFIX).await? {
            let Some(bytes) = storage.get(&key).await? else {
                continue;
            };
            let mut queue: AccountQueue = serde_json::from_slice(&bytes)?;
            let did = Did::new(&key[QUEUE_PREFIX.len()..]);
            if queue.recover_in_flight() {
                warn!(account = %did, "Recovered interrupted mutation attempts");
                storage.put(&key, &serde_json::to_vec(&queue)?).await?;
            }
            queues.insert(did, queue);
        }
        let pending: usize = queues
            .values()
            .map(|q| q.items.iter().filter(|m| m.status == MutationStatus::Pending).count())
            .sum();
        info!(accounts = queues.len(), pending, "Mutation queue loaded");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(QueueInner {
                storage,
                clock,
                queues: Mutex::new(queues),
                events,
                wake: Notify::new(),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves after the next enqueue, retry or explicit wake.
    pub async fn notified(&self) {
        self.inner.wake.notified().await
    }

    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Append a mutation for `account`. It is durable once this returns.
    pub async fn enqueue(
        &self,
        account: &Did,
        operation: Operation,
        invalidates: Invalidation,
    ) -> SyncResult<QueuedMutation> {
        let mut queues = self.inner.queues.lock().await;
        let queue = queues.entry(account.clone()).or_default();
        let seq = queue.next_seq.max(1);
        let item = QueuedMutation {
            seq,
            account: account.clone(),
            operation,
            enqueued_at: self.inner.clock.now(),
            attempts: 0,
            last_attempt_at: None,
            status: MutationStatus::Pending,
            invalidates,
            last_error: None,
        };

        let mut updated = queue.clone();
        updated.next_seq = seq + 1;
        updated.items.push(item.clone());
        self.inner.persist(account, &updated).await?;
        *queue = updated;
        drop(queues);

        debug!(account = %account, seq, op = %item.operation, "Mutation enqueued");
        self.inner.emit(MutationEvent::Enqueued {
            account: account.clone(),
            seq,
        });
        self.wake();
        Ok(item)
    }

    /// All items for `account` in sequence order.
    pub async fn list(&self, account: &Did) -> Vec<QueuedMutation> {
        let queues = self.inner.queues.lock().await;
        let mut items = queues
            .get(account)
            .map(|q| q.items.clone())
            .unwrap_or_default();
        items.sort_by_key(|m| m.seq);
        items
    }

    pub async fn failed(&self, account: &Did) -> Vec<QueuedMutation> {
        self.list(account)
            .await
            .into_iter()
            .filter(|m| m.status == MutationStatus::Failed)
            .collect()
    }

    /// Accounts that have an item waiting for replay or left in flight.
    pub async fn accounts_with_pending(&self) -> Vec<Did> {
        let queues = self.inner.queues.lock().await;
        let mut accounts: Vec<Did> = queues
            .iter()
            .filter(|(_, q)| q.has_unsettled())
            .map(|(did, _)| did.clone())
            .collect();
        accounts.sort();
        accounts
    }

    pub async fn accounts(&self) -> Vec<Did> {
        let mut accounts: Vec<Did> = self.inner.queues.lock().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Put a failed item back in line with a fresh attempt budget.
    pub async fn retry(&self, account: &Did, seq: u64) -> SyncResult<QueuedMutation> {
        let item = self
            .inner
            .update(account, seq, |item| {
                if item.status != MutationStatus::Failed {
                    return Err(SyncError::NotFound(format!(
                        "no failed mutation {} for {}",
                        seq, account
                    )));
                }
                item.status = MutationStatus::Pending;
                item.attempts = 0;
                item.last_error = None;
                Ok(())
            })
            .await?;
        info!(account = %account, seq, "Mutation requeued");
        self.wake();
        Ok(item)
    }

    /// Drop one item. Items in flight cannot be discarded.
    pub async fn discard(&self, account: &Did, seq: u64) -> SyncResult<QueuedMutation> {
        let mut queues = self.inner.queues.lock().await;
        let queue = queues
            .get_mut(account)
            .ok_or_else(|| SyncError::NotFound(format!("no mutation {} for {}", seq, account)))?;
        let index = queue
            .items
            .iter()
            .position(|m| m.seq == seq && m.status != MutationStatus::InFlight)
            .ok_or_else(|| {
                SyncError::NotFound(format!("no discardable mutation {} for {}", seq, account))
            })?;

        let mut updated = queue.clone();
        let item = updated.items.remove(index);
        self.inner.persist(account, &updated).await?;
        *queue = updated;
        drop(queues);

        info!(account = %account, seq, "Mutation discarded");
        self.inner.emit(MutationEvent::Discarded {
            account: account.clone(),
            seq,
        });
        Ok(item)
    }

    /// Drop the account's whole queue, e.g. after sign-out.
    pub async fn discard_account(&self, account: &Did) -> SyncResult<usize> {
        let mut queues = self.inner.queues.lock().await;
        if !queues.contains_key(account) {
            return Ok(0);
        }
        self.inner.storage.delete(&storage_key(account)).await?;
        let removed = queues.remove(account).map(|q| q.items).unwrap_or_default();
        drop(queues);

        let count = removed
            .iter()
            .filter(|m| m.status != MutationStatus::Confirmed)
            .count();
        if count > 0 {
            warn!(account = %account, count, "Discarded queued mutations");
        }
        for item in removed {
            self.inner.emit(MutationEvent::Discarded {
                account: account.clone(),
                seq: item.seq,
            });
        }
        Ok(count)
    }

    /// Remove confirmed items from durable storage.
    pub async fn compact(&self, account: &Did) -> SyncResult<usize> {
        let mut queues = self.inner.queues.lock().await;
        let Some(queue) = queues.get_mut(account) else {
            return Ok(0);
        };
        let mut updated = queue.clone();
        updated
            .items
            .retain(|m| m.status != MutationStatus::Confirmed);
        let removed = queue.items.len() - updated.items.len();
        if removed > 0 {
            self.inner.persist(account, &updated).await?;
            *queue = updated;
            debug!(account = %account, removed, "Compacted mutation queue");
        }
        Ok(removed)
    }

    // =========================================================================
    // Drainer hooks
    // =========================================================================

    pub(crate) fn notify_paused(&self, account: &Did) {
        self.inner.emit(MutationEvent::Paused {
            account: account.clone(),
        });
    }

    pub(crate) async fn next_pending(&self, account: &Did) -> Option<QueuedMutation> {
        self.inner
            .queues
            .lock()
            .await
            .get(account)
            .and_then(|q| q.next_pending().cloned())
    }

    /// Return items left in flight by an attempt that never settled (e.g.
    /// the settlement could not be persisted). Only called by the account's
    /// sole replay worker.
    pub(crate) async fn recover_stalled(&self, account: &Did) -> SyncResult<bool> {
        let mut queues = self.inner.queues.lock().await;
        let Some(queue) = queues.get_mut(account) else {
            return Ok(false);
        };
        let mut updated = queue.clone();
        if !updated.recover_in_flight() {
            return Ok(false);
        }
        self.inner.persist(account, &updated).await?;
        *queue = updated;
        drop(queues);

        warn!(account = %account, "Recovered stalled mutation attempt");
        Ok(true)
    }

    /// Mark the item in flight and count the attempt.
    pub(crate) async fn begin_attempt(&self, account: &Did, seq: u64) -> SyncResult<QueuedMutation> {
        let now = self.inner.clock.now();
        self.inner
            .update(account, seq, |item| {
                if item.status != MutationStatus::Pending {
                    return Err(SyncError::NotFound(format!(
                        "no pending mutation {} for {}",
                        seq, account
                    )));
                }
                item.status = MutationStatus::InFlight;
                item.attempts += 1;
                item.last_attempt_at = Some(now);
                Ok(())
            })
            .await
    }

    pub(crate) async fn settle(
        &self,
        account: &Did,
        seq: u64,
        settlement: Settlement,
    ) -> SyncResult<QueuedMutation> {
        self.inner
            .update(account, seq, |item| {
                match settlement {
                    Settlement::Confirmed => {
                        item.status = MutationStatus::Confirmed;
                        item.last_error = None;
                    }
                    Settlement::Pending { error, refund } => {
                        item.status = MutationStatus::Pending;
                        if refund {
                            item.attempts = item.attempts.saturating_sub(1);
                        }
                        if error.is_some() {
                            item.last_error = error;
                        }
                    }
                    Settlement::Failed(error) => {
                        item.status = MutationStatus::Failed;
                        item.last_error = Some(error);
                    }
                }
                Ok(())
            })
            .await
    }
}

impl QueueInner {
    fn emit(&self, event: MutationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn persist(&self, account: &Did, queue: &AccountQueue) -> SyncResult<()> {
        let bytes = serde_json::to_vec(queue)?;
        self.storage.put(&storage_key(account), &bytes).await?;
        Ok(())
    }

    /// Apply `change` to one item, persist, then publish its new status.
    /// In-memory state only changes once the write succeeded.
    async fn update<F>(&self, account: &Did, seq: u64, change: F) -> SyncResult<QueuedMutation>
    where
        F: FnOnce(&mut QueuedMutation) -> SyncResult<()>,
    {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(account)
            .ok_or_else(|| SyncError::NotFound(format!("no mutation {} for {}", seq, account)))?;
        let mut updated = queue.clone();
        let item = updated
            .item_mut(seq)
            .ok_or_else(|| SyncError::NotFound(format!("no mutation {} for {}", seq, account)))?;
        change(item)?;
        let item = item.clone();
        self.persist(account, &updated).await?;
        *queue = updated;
        drop(queues);

        self.emit(MutationEvent::StatusChanged {
            account: account.clone(),
            seq,
            status: item.status,
        });
        Ok(item)
    }
}
