//! Facade tying sessions, the request pipeline, the cache and the mutation
//! queue together. This is the surface a UI or CLI talks to.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Operation, RemoteService, RequestPipeline};
use crate::auth::{Account, CredentialCipher, CredentialStore, Did, RestoreReport, SessionEvent, SessionManager};
use crate::cache::{CacheEvent, CacheKey, Lookup, PersistedCache, Query, SubscriptionId, SweepReport};
use crate::clock::{Clock, Connectivity, SystemClock};
use crate::config::SyncPolicy;
use crate::error::{SyncError, SyncResult};
use crate::queue::{DrainReport, Invalidation, MutationEvent, MutationQueue, QueueDrainer, QueuedMutation};
use crate::storage::StorageBackend;

struct Workers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct SyncClientBuilder {
    service: Arc<dyn RemoteService>,
    storage: Arc<dyn StorageBackend>,
    cipher: CredentialCipher,
    clock: Arc<dyn Clock>,
    connectivity: Connectivity,
    policy: SyncPolicy,
}

impl SyncClientBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Load persisted state and resume stored sessions. Workers are not
    /// started; call [`SyncClient::start`].
    pub async fn open(self) -> SyncResult<SyncClient> {
        let credentials = CredentialStore::new(Arc::clone(&self.storage), self.cipher);
        let sessions = SessionManager::new(
            Arc::clone(&self.service),
            credentials,
            Arc::clone(&self.clock),
            self.connectivity.clone(),
            self.policy.refresh_backoff.clone(),
            self.policy.request_timeout(),
        );
        let restored = sessions.restore().await?;
        log_restore(&restored);

        let pipeline = RequestPipeline::new(
            self.service,
            sessions.clone(),
            self.connectivity.clone(),
            self.policy.request_retry.clone(),
            self.policy.request_timeout(),
        );
        let cache = PersistedCache::open(
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
            pipeline.clone(),
            self.policy.cache.clone(),
        )
        .await?;
        let queue = MutationQueue::open(self.storage, self.clock).await?;
        let drainer = Arc::new(QueueDrainer::new(
            queue.clone(),
            pipeline.clone(),
            cache.clone(),
            self.policy.queue_backoff.clone(),
            self.policy.queue.max_attempts,
        ));

        Ok(SyncClient {
            sessions,
            pipeline,
            cache,
            queue,
            drainer,
            connectivity: self.connectivity,
            policy: self.policy,
            workers: Mutex::new(None),
        })
    }
}

fn log_restore(report: &RestoreReport) {
    for (did, e) in &report.failed {
        warn!(account = %did, error = %e, "Stored session could not be restored");
    }
    debug!(restored = report.restored.len(), "Sessions restored");
}

pub struct SyncClient {
    sessions: SessionManager,
    pipeline: RequestPipeline,
    cache: PersistedCache,
    queue: MutationQueue,
    drainer: Arc<QueueDrainer>,
    connectivity: Connectivity,
    policy: SyncPolicy,
    workers: Mutex<Option<Workers>>,
}

impl SyncClient {
    pub fn builder(
        service: Arc<dyn RemoteService>,
        storage: Arc<dyn StorageBackend>,
        cipher: CredentialCipher,
    ) -> SyncClientBuilder {
        SyncClientBuilder {
            service,
            storage,
            cipher,
            clock: Arc::new(SystemClock),
            connectivity: Connectivity::default(),
            policy: SyncPolicy::default(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn cache(&self) -> &PersistedCache {
        &self.cache
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    fn workers(&self) -> MutexGuard<'_, Option<Workers>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Start the cache sweeper and the mutation drainer. No-op if running.
    pub fn start(&self) {
        let mut workers = self.workers();
        if workers.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let handles = vec![
            self.cache.spawn_sweeper(shutdown.clone()),
            Arc::clone(&self.drainer).spawn(shutdown.clone()),
        ];
        info!("Background workers started");
        *workers = Some(Workers { shutdown, handles });
    }

    /// Stop background workers and wait for them to finish.
    pub async fn stop(&self) {
        let Some(workers) = self.workers().take() else {
            return;
        };
        workers.shutdown.cancel();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background worker ended abnormally");
            }
        }
        info!("Background workers stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers().is_some()
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub async fn sign_in(&self, identifier: &str, secret: &str, activate: bool) -> SyncResult<Account> {
        self.sessions.sign_in(identifier, secret, activate).await
    }

    /// Sign out, then drop the account's queued mutations and cached data.
    pub async fn sign_out(&self, did: &Did) -> SyncResult<()> {
        self.sessions.sign_out(did).await?;
        self.queue.discard_account(did).await?;
        self.cache.purge_account(did).await?;
        Ok(())
    }

    pub async fn switch_active(&self, did: &Did) -> SyncResult<()> {
        self.sessions.switch_active(did).await
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.sessions.accounts()
    }

    pub fn active_account(&self) -> Option<Did> {
        self.sessions.active_account()
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &CacheKey) -> Lookup {
        self.cache.get(key)
    }

    pub async fn fetch(&self, query: &Query) -> SyncResult<Lookup> {
        self.cache.fetch(query).await
    }

    /// Uncached call, e.g. for one-off lookups.
    pub async fn call(&self, operation: &Operation, account: Option<&Did>) -> SyncResult<serde_json::Value> {
        self.pipeline.execute(operation, account).await
    }

    pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.cache.subscribe(key, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        self.cache.sweep().await
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queue `operation` for `account` (the active account when `None`).
    /// Returns once the mutation is durable; replay happens in the background.
    pub async fn mutate(
        &self,
        operation: Operation,
        invalidates: Invalidation,
        account: Option<&Did>,
    ) -> SyncResult<QueuedMutation> {
        let did = match account {
            Some(did) => did.clone(),
            None => self
                .sessions
                .active_account()
                .ok_or_else(|| SyncError::Unauthorized("no signed-in account".to_string()))?,
        };
        if self.sessions.session(&did).is_none() {
            return Err(SyncError::AccountNotSignedIn(did));
        }
        self.queue.enqueue(&did, operation, invalidates).await
    }

    pub async fn pending_mutations(&self, did: &Did) -> Vec<QueuedMutation> {
        self.queue.list(did).await
    }

    pub async fn failed_mutations(&self, did: &Did) -> Vec<QueuedMutation> {
        self.queue.failed(did).await
    }

    pub async fn retry_mutation(&self, did: &Did, seq: u64) -> SyncResult<QueuedMutation> {
        self.queue.retry(did, seq).await
    }

    pub async fn discard_mutation(&self, did: &Did, seq: u64) -> SyncResult<QueuedMutation> {
        self.queue.discard(did, seq).await
    }

    /// Replay `did`'s queue now, on the caller's task.
    pub async fn drain(&self, did: &Did) -> SyncResult<DrainReport> {
        self.drainer.drain_account(did).await
    }

    pub fn mutation_events(&self) -> broadcast::Receiver<MutationEvent> {
        self.queue.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::queue::MutationStatus;
    use crate::test_utils::{fixture, ALICE_DID, BOB_DID};

    fn post(text: &str) -> Operation {
        Operation::procedure("com.atproto.repo.createRecord", json!({ "text": text }))
    }

    #[tokio::test]
    async fn test_open_restores_sessions() {
        let f = fixture();
        f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap();

        let client = f.client().await;
        assert_eq!(client.active_account(), Some(Did::new(ALICE_DID)));
        assert_eq!(client.accounts().len(), 1);
    }

    #[tokio::test]
    async fn test_mutate_requires_signed_in_account() {
        let f = fixture();
        let client = f.client().await;
        let err = client.mutate(post("hi"), Invalidation::none(), None).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));

        let err = client
            .mutate(post("hi"), Invalidation::none(), Some(&Did::new(BOB_DID)))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::AccountNotSignedIn(Did::new(BOB_DID)));
    }

    #[tokio::test]
    async fn test_sign_out_discards_queue_and_cache() {
        let f = fixture();
        let client = f.client().await;
        let alice = client.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        let key = CacheKey::new("feed", &["home"]);
        client
            .fetch(&Query::new(key.clone(), Operation::query("app.bsky.feed.getTimeline")).as_account(alice.clone()))
            .await
            .unwrap();
        f.connectivity.set_online(false);
        client.mutate(post("hi"), Invalidation::none(), None).await.unwrap();

        client.sign_out(&alice).await.unwrap();
        assert!(client.pending_mutations(&alice).await.is_empty());
        assert_eq!(client.get(&key), Lookup::absent());
        assert_eq!(client.active_account(), None);
    }

    #[tokio::test]
    async fn test_start_and_stop_workers() {
        let f = fixture();
        let client = f.client().await;
        client.sign_in("alice.test", "hunter2", true).await.unwrap();
        client.start();
        client.start();
        assert!(client.is_running());

        let mut events = client.mutation_events();
        let item = client.mutate(post("hi"), Invalidation::none(), None).await.unwrap();
        let confirmed = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let MutationEvent::StatusChanged {
                    seq,
                    status: MutationStatus::Confirmed,
                    ..
                } = events.recv().await.unwrap()
                {
                    break seq;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(confirmed, item.seq);

        client.stop().await;
        assert!(!client.is_running());
    }
}
