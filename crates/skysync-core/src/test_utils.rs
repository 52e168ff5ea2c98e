//! Shared fixtures for unit and scenario tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::api::{CallError, Operation, RemoteService, RequestPipeline};
use crate::auth::{CredentialCipher, CredentialStore, Did, SessionManager, SessionTokens};
use crate::backoff::BackoffPolicy;
use crate::cache::PersistedCache;
use crate::client::SyncClient;
use crate::clock::{Clock, Connectivity, ManualClock};
use crate::config::{CachePolicy, QueuePolicy, SyncPolicy};
use crate::queue::{MutationQueue, QueueDrainer};
use crate::storage::MemoryStorage;

pub const ALICE_DID: &str = "did:plc:alice";
pub const BOB_DID: &str = "did:plc:bob";

/// (handle, password, did)
const KNOWN_ACCOUNTS: &[(&str, &str, &str)] = &[
    ("alice.test", "hunter2", ALICE_DID),
    ("bob.test", "pw", BOB_DID),
];

const MOCK_SERVICE_URL: &str = "https://pds.test";

/// Poll `condition` until it holds, failing the test after about a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not met in time");
}

#[derive(Default)]
struct MockState {
    next_token: u64,
    access_tokens: HashSet<String>,
    /// refresh token -> (did, handle)
    refresh_tokens: HashMap<String, (Did, String)>,
    calls: Vec<(String, Option<String>)>,
    script: VecDeque<Result<Value, CallError>>,
    transient_refresh_failures: u32,
}

impl MockState {
    fn issue(&mut self, did: &Did, handle: &str) -> SessionTokens {
        self.next_token += 1;
        let access = format!("access-{}", self.next_token);
        let refresh = format!("refresh-{}", self.next_token);
        self.access_tokens.insert(access.clone());
        self.refresh_tokens
            .insert(refresh.clone(), (did.clone(), handle.to_string()));
        SessionTokens {
            did: did.clone(),
            handle: handle.to_string(),
            email: None,
            access_token: access,
            refresh_token: refresh,
            expires_at: None,
        }
    }
}

/// In-process protocol service with scripted outcomes and counters.
pub struct MockService {
    state: Mutex<MockState>,
    sessions_created: AtomicUsize,
    refresh_count: AtomicUsize,
    delete_count: AtomicUsize,
    call_count: AtomicUsize,
    refresh_gate: watch::Sender<bool>,
    call_gate: watch::Sender<bool>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            sessions_created: AtomicUsize::new(0),
            refresh_count: AtomicUsize::new(0),
            delete_count: AtomicUsize::new(0),
            call_count: AtomicUsize::new(0),
            refresh_gate: watch::channel(true).0,
            call_gate: watch::channel(true).0,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.delete_count.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// (nsid, access token) of every call, in order.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.state().calls.clone()
    }

    /// Outcomes for the next calls, consumed in order before the default
    /// behaviour applies.
    pub fn script_calls(&self, outcomes: Vec<Result<Value, CallError>>) {
        self.state().script.extend(outcomes);
    }

    /// Every access token issued so far stops being accepted.
    pub fn expire_access_tokens(&self) {
        self.state().access_tokens.clear();
    }

    /// Every refresh token issued so far stops being accepted.
    pub fn revoke_refresh_tokens(&self) {
        self.state().refresh_tokens.clear();
    }

    pub fn fail_refresh_transiently(&self, times: u32) {
        self.state().transient_refresh_failures = times;
    }

    pub fn hold_refresh(&self) {
        self.refresh_gate.send_replace(false);
    }

    pub fn release_refresh(&self) {
        self.refresh_gate.send_replace(true);
    }

    pub fn hold_calls(&self) {
        self.call_gate.send_replace(false);
    }

    pub fn release_calls(&self) {
        self.call_gate.send_replace(true);
    }

    async fn pass(gate: &watch::Sender<bool>) {
        let mut rx = gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl RemoteService for MockService {
    async fn create_session(&self, identifier: &str, secret: &str) -> Result<SessionTokens, CallError> {
        let (handle, password, did) = KNOWN_ACCOUNTS
            .iter()
            .find(|(handle, _, did)| *handle == identifier || *did == identifier)
            .ok_or_else(|| CallError::Auth("AuthenticationRequired".to_string()))?;
        if secret != *password {
            return Err(CallError::Auth("AuthenticationRequired".to_string()));
        }
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().issue(&Did::new(*did), handle))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, CallError> {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.refresh_gate).await;

        let mut state = self.state();
        if state.transient_refresh_failures > 0 {
            state.transient_refresh_failures -= 1;
            return Err(CallError::Transient("503 Service Unavailable".to_string()));
        }
        let (did, handle) = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| CallError::Auth("ExpiredToken".to_string()))?;
        Ok(state.issue(&did, &handle))
    }

    async fn delete_session(&self, refresh_token: &str) -> Result<(), CallError> {
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        self.state().refresh_tokens.remove(refresh_token);
        Ok(())
    }

    async fn call(&self, operation: &Operation, access_token: Option<&str>) -> Result<Value, CallError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.state()
            .calls
            .push((operation.nsid.clone(), access_token.map(str::to_string)));
        Self::pass(&self.call_gate).await;

        let mut state = self.state();
        if let Some(outcome) = state.script.pop_front() {
            return outcome;
        }
        if let Some(token) = access_token {
            if !state.access_tokens.contains(token) {
                return Err(CallError::Auth("ExpiredToken".to_string()));
            }
        }
        Ok(json!({ "nsid": operation.nsid, "n": n }))
    }

    fn service_url(&self) -> &str {
        MOCK_SERVICE_URL
    }
}

/// Retries without delay so tests run fast.
pub fn test_policy() -> SyncPolicy {
    SyncPolicy {
        request_retry: BackoffPolicy::immediate(3),
        refresh_backoff: BackoffPolicy::immediate(3),
        queue_backoff: BackoffPolicy::immediate(3),
        request_timeout_ms: 1_000,
        cache: CachePolicy::default(),
        queue: QueuePolicy { max_attempts: 3 },
    }
}

pub struct Fixture {
    pub storage: Arc<MemoryStorage>,
    pub cipher: CredentialCipher,
    pub credentials: CredentialStore,
    pub service: Arc<MockService>,
    pub clock: ManualClock,
    pub connectivity: Connectivity,
    pub policy: SyncPolicy,
    pub sessions: SessionManager,
}

pub fn fixture() -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let cipher = CredentialCipher::from_key(&[7u8; 32]);
    let credentials = CredentialStore::new(storage.clone(), cipher.clone());
    let service = Arc::new(MockService::new());
    let clock = ManualClock::default();
    let connectivity = Connectivity::new(true);
    let policy = test_policy();
    let sessions = SessionManager::new(
        service.clone(),
        credentials.clone(),
        Arc::new(clock.clone()),
        connectivity.clone(),
        policy.refresh_backoff.clone(),
        policy.request_timeout(),
    );
    Fixture {
        storage,
        cipher,
        credentials,
        service,
        clock,
        connectivity,
        policy,
        sessions,
    }
}

impl Fixture {
    pub fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// A second manager over the same storage, as after a restart.
    pub fn new_session_manager(&self) -> SessionManager {
        SessionManager::new(
            self.service.clone(),
            self.credentials.clone(),
            self.shared_clock(),
            self.connectivity.clone(),
            self.policy.refresh_backoff.clone(),
            self.policy.request_timeout(),
        )
    }

    pub fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(
            self.service.clone(),
            self.sessions.clone(),
            self.connectivity.clone(),
            self.policy.request_retry.clone(),
            self.policy.request_timeout(),
        )
    }

    pub async fn cache(&self) -> PersistedCache {
        PersistedCache::open(
            self.storage.clone(),
            self.shared_clock(),
            self.pipeline(),
            self.policy.cache.clone(),
        )
        .await
        .unwrap()
    }

    pub async fn queue(&self) -> MutationQueue {
        MutationQueue::open(self.storage.clone(), self.shared_clock())
            .await
            .unwrap()
    }

    pub async fn queue_stack(&self) -> (MutationQueue, PersistedCache, QueueDrainer) {
        let queue = self.queue().await;
        let cache = self.cache().await;
        let drainer = QueueDrainer::new(
            queue.clone(),
            self.pipeline(),
            cache.clone(),
            self.policy.queue_backoff.clone(),
            self.policy.queue.max_attempts,
        );
        (queue, cache, drainer)
    }

    /// A full client over this fixture's storage, service, clock and
    /// connectivity, with its own session manager.
    pub async fn client(&self) -> SyncClient {
        SyncClient::builder(self.service.clone(), self.storage.clone(), self.cipher.clone())
            .clock(self.shared_clock())
            .connectivity(self.connectivity.clone())
            .policy(self.policy.clone())
            .open()
            .await
            .unwrap()
    }
}
