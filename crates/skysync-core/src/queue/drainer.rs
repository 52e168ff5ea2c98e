//! Background replay of queued mutations.
//!
//! Each account drains on its own task, strictly in sequence order, so a
//! backing-off account never holds up another one. The loop wakes on
//! enqueue, connectivity changes and session events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MutationQueue, QueuedMutation, Settlement};
use crate::api::RequestPipeline;
use crate::auth::{Did, SessionEvent};
use crate::backoff::BackoffPolicy;
use crate::cache::PersistedCache;
use crate::error::{SyncError, SyncResult};

/// Outcome of draining one account.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub confirmed: Vec<u64>,
    pub failed: Vec<u64>,
    /// Discarded because the account's credentials are gone.
    pub discarded: usize,
    /// Stopped waiting for re-authentication.
    pub paused: bool,
    /// Another worker was already replaying the account; nothing was done.
    pub busy: bool,
}

/// What the drain loop does after one attempt.
enum Step {
    Continue,
    Stop,
}

#[derive(Default)]
struct DrainerState {
    running: HashSet<Did>,
    paused: HashSet<Did>,
}

/// Exclusive right to replay one account, released on drop.
struct RunningClaim<'a> {
    drainer: &'a QueueDrainer,
    account: Did,
}

impl Drop for RunningClaim<'_> {
    fn drop(&mut self) {
        self.drainer.state().running.remove(&self.account);
    }
}

pub struct QueueDrainer {
    queue: MutationQueue,
    pipeline: RequestPipeline,
    cache: PersistedCache,
    backoff: BackoffPolicy,
    max_attempts: u32,
    state: Mutex<DrainerState>,
}

impl QueueDrainer {
    pub fn new(
        queue: MutationQueue,
        pipeline: RequestPipeline,
        cache: PersistedCache,
        backoff: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            pipeline,
            cache,
            backoff,
            max_attempts: max_attempts.max(1),
            state: Mutex::new(DrainerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DrainerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, account: &Did) -> Option<RunningClaim<'_>> {
        if !self.state().running.insert(account.clone()) {
            return None;
        }
        Some(RunningClaim {
            drainer: self,
            account: account.clone(),
        })
    }

    pub fn is_paused(&self, account: &Did) -> bool {
        self.state().paused.contains(account)
    }

    /// Lift a pause, e.g. after the account re-authenticated.
    pub fn resume(&self, account: &Did) {
        if self.state().paused.remove(account) {
            debug!(account = %account, "Mutation replay resumed");
            self.queue.wake();
        }
    }

    /// Drive replay until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut connectivity = self.pipeline.connectivity().subscribe();
            let mut sessions = self.pipeline.sessions().subscribe();
            info!("Mutation drainer started");
            loop {
                if self.pipeline.connectivity().is_online() {
                    self.dispatch(&shutdown).await;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.queue.notified() => {}
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    event = sessions.recv() => match event {
                        Ok(SessionEvent::Active(did)) => self.resume(&did),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {
                            let paused: Vec<Did> = self.state().paused.drain().collect();
                            debug!(count = paused.len(), "Session events lagged, resuming paused accounts");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("Mutation drainer stopped");
        })
    }

    /// Start a worker for every account with pending work that is neither
    /// running nor paused.
    async fn dispatch(self: &Arc<Self>, shutdown: &CancellationToken) {
        for did in self.queue.accounts_with_pending().await {
            {
                let mut state = self.state();
                if state.paused.contains(&did) || !state.running.insert(did.clone()) {
                    continue;
                }
            }
            let drainer = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = drainer.drain_with_shutdown(&did, &shutdown).await;
                drainer.state().running.remove(&did);
                match result {
                    // Pick up anything enqueued while this worker was finishing
                    Ok(_) => drainer.queue.wake(),
                    // Left for the next enqueue or connectivity change
                    Err(e) => warn!(account = %did, error = %e, "Mutation replay failed"),
                }
            });
        }
    }

    /// Replay `account`'s pending mutations in order until its queue is
    /// empty, the account pauses, or the service is unreachable.
    ///
    /// Returns a `busy` report without touching the queue when a background
    /// worker is already replaying the account.
    pub async fn drain_account(&self, account: &Did) -> SyncResult<DrainReport> {
        let Some(_claim) = self.claim(account) else {
            debug!(account = %account, "Replay already running");
            return Ok(DrainReport {
                busy: true,
                ..DrainReport::default()
            });
        };
        self.drain_with_shutdown(account, &CancellationToken::new())
            .await
    }

    async fn drain_with_shutdown(
        &self,
        account: &Did,
        shutdown: &CancellationToken,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        // Caller holds the account's claim, so anything in flight is left
        // over from an attempt whose settlement was never recorded
        self.queue.recover_stalled(account).await?;
        loop {
            if shutdown.is_cancelled() || !self.pipeline.connectivity().is_online() {
                break;
            }
            if !self.pipeline.sessions().credentials().contains(account).await? {
                report.discarded = self.queue.discard_account(account).await?;
                warn!(account = %account, discarded = report.discarded, "No credentials, dropping queued mutations");
                return Ok(report);
            }
            let Some(item) = self.queue.next_pending(account).await else {
                break;
            };
            match self.attempt(item, shutdown, &mut report).await? {
                Step::Continue => {}
                Step::Stop => break,
            }
        }
        self.queue.compact(account).await?;
        Ok(report)
    }

    async fn attempt(
        &self,
        item: QueuedMutation,
        shutdown: &CancellationToken,
        report: &mut DrainReport,
    ) -> SyncResult<Step> {
        let did = item.account.clone();
        let seq = item.seq;
        let Some(cancel) = self.pipeline.sessions().cancellation_token(&did) else {
            // Credentials exist but the session is not loaded
            self.pause(&did, report);
            return Ok(Step::Stop);
        };

        let item = self.queue.begin_attempt(&did, seq).await?;
        debug!(account = %did, seq, attempt = item.attempts, op = %item.operation, "Replaying mutation");

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = shutdown.cancelled() => None,
            result = self.pipeline.execute(&item.operation, Some(&did)) => Some(result),
        };
        let Some(result) = result else {
            debug!(account = %did, seq, "Replay interrupted");
            self.queue
                .settle(&did, seq, Settlement::Pending { error: None, refund: true })
                .await?;
            return Ok(Step::Stop);
        };

        match result {
            Ok(_) => {
                self.queue.settle(&did, seq, Settlement::Confirmed).await?;
                info!(account = %did, seq, "Mutation confirmed");
                report.confirmed.push(seq);
                self.apply_invalidations(&item).await;
                Ok(Step::Continue)
            }
            Err(e @ SyncError::Unauthorized(_)) | Err(e @ SyncError::AccountNotSignedIn(_)) => {
                self.queue
                    .settle(
                        &did,
                        seq,
                        Settlement::Pending {
                            error: Some(e.to_string()),
                            refund: true,
                        },
                    )
                    .await?;
                self.pause(&did, report);
                Ok(Step::Stop)
            }
            Err(SyncError::RefreshRevoked(_)) => {
                // Credentials were purged; the next pass discards the queue
                self.queue
                    .settle(&did, seq, Settlement::Pending { error: None, refund: true })
                    .await?;
                Ok(Step::Continue)
            }
            Err(SyncError::NetworkUnavailable(msg)) if !self.pipeline.connectivity().is_online() => {
                debug!(account = %did, seq, "Went offline mid-replay");
                self.queue
                    .settle(
                        &did,
                        seq,
                        Settlement::Pending {
                            error: Some(msg),
                            refund: true,
                        },
                    )
                    .await?;
                Ok(Step::Stop)
            }
            Err(e) if e.is_retryable() => {
                if item.attempts >= self.max_attempts {
                    warn!(account = %did, seq, attempts = item.attempts, error = %e, "Mutation failed, giving up");
                    self.queue
                        .settle(&did, seq, Settlement::Failed(e.to_string()))
                        .await?;
                    report.failed.push(seq);
                    return Ok(Step::Continue);
                }
                self.queue
                    .settle(
                        &did,
                        seq,
                        Settlement::Pending {
                            error: Some(e.to_string()),
                            refund: false,
                        },
                    )
                    .await?;
                let delay = self.backoff.delay_for(item.attempts);
                debug!(account = %did, seq, attempt = item.attempts, delay_ms = delay.as_millis() as u64, "Mutation will be retried");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(Step::Stop),
                    _ = shutdown.cancelled() => return Ok(Step::Stop),
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(Step::Continue)
            }
            Err(e) => {
                warn!(account = %did, seq, error = %e, "Mutation rejected");
                self.queue
                    .settle(&did, seq, Settlement::Failed(e.to_string()))
                    .await?;
                report.failed.push(seq);
                Ok(Step::Continue)
            }
        }
    }

    fn pause(&self, did: &Did, report: &mut DrainReport) {
        report.paused = true;
        if self.state().paused.insert(did.clone()) {
            warn!(account = %did, "Mutation replay paused until the account is signed in again");
            self.queue.notify_paused(did);
        }
    }

    async fn apply_invalidations(&self, item: &QueuedMutation) {
        for key in &item.invalidates.keys {
            if let Err(e) = self.cache.invalidate(key).await {
                warn!(key = %key, error = %e, "Failed to invalidate after mutation");
            }
        }
        for domain in &item.invalidates.domains {
            if let Err(e) = self.cache.invalidate_domain(domain).await {
                warn!(domain = %domain, error = %e, "Failed to invalidate after mutation");
            }
        }
    }
}
