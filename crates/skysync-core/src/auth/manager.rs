//! Owner of every signed-in account and its session.
//!
//! The registry is the single source of truth for which accounts are signed
//! in and which one is active. Other components receive a `SessionManager`
//! handle (cheap to clone) instead of reaching for global state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Account, CredentialStore, Did, Session, SessionState};
use crate::api::{CallError, RemoteService};
use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, Connectivity};
use crate::error::{SyncError, SyncResult};

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

type SharedRefresh = Shared<BoxFuture<'static, SyncResult<Session>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The account has a usable, current session.
    Active(Did),
    /// The access credential could not be renewed; reads may continue with
    /// the previous one.
    Expired(Did),
    SignedOut(Did),
    /// The active account changed.
    Switched(Option<Did>),
}

/// Outcome of resuming stored sessions at startup.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<Did>,
    pub failed: Vec<(Did, SyncError)>,
}

struct AccountSlot {
    session: Session,
    state: SessionState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<Did, AccountSlot>,
    active: Option<Did>,
    /// Identifiers with a sign-in exchange in progress.
    authenticating: HashSet<String>,
}

impl Registry {
    /// Pick a replacement active account after `removed` went away.
    fn next_active(&self) -> Option<Did> {
        let mut dids: Vec<&Did> = self.slots.keys().collect();
        dids.sort();
        dids.first().map(|d| (*d).clone())
    }
}

struct Inner {
    service: Arc<dyn RemoteService>,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
    connectivity: Connectivity,
    refresh_backoff: BackoffPolicy,
    timeout: Duration,
    registry: Mutex<Registry>,
    inflight: Mutex<HashMap<Did, SharedRefresh>>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        service: Arc<dyn RemoteService>,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
        connectivity: Connectivity,
        refresh_backoff: BackoffPolicy,
        timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                service,
                credentials,
                clock,
                connectivity,
                refresh_backoff,
                timeout,
                registry: Mutex::new(Registry::default()),
                inflight: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn active_account(&self) -> Option<Did> {
        self.inner.registry().active.clone()
    }

    /// Signed-in accounts, active first.
    pub fn accounts(&self) -> Vec<Account> {
        let registry = self.inner.registry();
        let mut accounts: Vec<Account> = registry
            .slots
            .values()
            .map(|s| s.session.account.clone())
            .collect();
        accounts.sort_by(|a, b| {
            let a_active = registry.active.as_ref() == Some(&a.did);
            let b_active = registry.active.as_ref() == Some(&b.did);
            b_active.cmp(&a_active).then_with(|| a.did.cmp(&b.did))
        });
        accounts
    }

    pub fn state(&self, did: &Did) -> SessionState {
        let now = self.inner.clock.now();
        match self.inner.registry().slots.get(did) {
            Some(slot) if slot.state == SessionState::Active && slot.session.is_expired(now) => {
                SessionState::Expired
            }
            Some(slot) => slot.state,
            None => SessionState::SignedOut,
        }
    }

    pub fn is_authenticating(&self, identifier: &str) -> bool {
        self.inner.registry().authenticating.contains(identifier)
    }

    pub fn session(&self, did: &Did) -> Option<Session> {
        self.inner
            .registry()
            .slots
            .get(did)
            .map(|slot| slot.session.clone())
    }

    pub fn access_token(&self, did: &Did) -> Option<String> {
        self.inner
            .registry()
            .slots
            .get(did)
            .map(|slot| slot.session.access_token.clone())
    }

    /// Resolve `account` (or the active account) to its current session.
    /// `Ok(None)` means nobody is signed in and no account was requested.
    pub fn resolve(&self, account: Option<&Did>) -> SyncResult<Option<Session>> {
        let registry = self.inner.registry();
        let did = match account.or(registry.active.as_ref()) {
            Some(did) => did,
            None => return Ok(None),
        };
        registry
            .slots
            .get(did)
            .map(|slot| Some(slot.session.clone()))
            .ok_or_else(|| SyncError::AccountNotSignedIn(did.clone()))
    }

    /// Token that fires when the account signs out. Work done on behalf of
    /// the account should stop when it is cancelled.
    pub fn cancellation_token(&self, did: &Did) -> Option<CancellationToken> {
        self.inner
            .registry()
            .slots
            .get(did)
            .map(|slot| slot.cancel.child_token())
    }

    // =========================================================================
    // Sign in / restore
    // =========================================================================

    /// Authenticate a new (or returning) account. The account becomes active
    /// when `activate` is set or when no other account is active.
    pub async fn sign_in(&self, identifier: &str, secret: &str, activate: bool) -> SyncResult<Account> {
        let inner = &self.inner;
        if !inner.connectivity.is_online() {
            return Err(SyncError::NetworkUnavailable("offline".to_string()));
        }

        inner.registry().authenticating.insert(identifier.to_string());
        debug!(identifier, "Authenticating");

        let outcome = inner
            .with_timeout(inner.service.create_session(identifier, secret))
            .await;

        inner.registry().authenticating.remove(identifier);

        let tokens = match outcome {
            Ok(tokens) => tokens,
            Err(CallError::Auth(msg)) => {
                warn!(identifier, "Sign in rejected");
                return Err(SyncError::InvalidCredential(msg));
            }
            Err(CallError::Rejected { error, message }) => {
                warn!(identifier, error = %error, "Sign in rejected");
                return Err(SyncError::InvalidCredential(format!("{}: {}", error, message)));
            }
            Err(CallError::Transient(msg)) => {
                warn!(identifier, error = %msg, "Sign in failed, service unreachable");
                return Err(SyncError::NetworkUnavailable(msg));
            }
        };

        let session = Session::from_tokens(tokens, inner.service.service_url(), inner.clock.now());
        let did = session.did().clone();

        // Durable first: a session we cannot persist is not handed out.
        inner.credentials.put(&session).await?;

        let (account, switched) = {
            let mut registry = inner.registry();
            let cancel = match registry.slots.remove(&did) {
                Some(previous) if !previous.cancel.is_cancelled() => previous.cancel,
                _ => CancellationToken::new(),
            };
            let account = session.account.clone();
            registry.slots.insert(
                did.clone(),
                AccountSlot {
                    session,
                    state: SessionState::Active,
                    cancel,
                },
            );
            let switched = if activate || registry.active.is_none() {
                let changed = registry.active.as_ref() != Some(&did);
                registry.active = Some(did.clone());
                changed
            } else {
                false
            };
            (account, switched)
        };

        if switched {
            inner.credentials.set_active(Some(&did)).await?;
        }

        info!(account = %did, handle = %account.handle, "Signed in");
        inner.emit(SessionEvent::Active(did.clone()));
        if switched {
            inner.emit(SessionEvent::Switched(Some(did)));
        }
        Ok(account)
    }

    /// Resume every stored session. Sessions past expiry come back as
    /// `Expired` and are refreshed on first use.
    pub async fn restore(&self) -> SyncResult<RestoreReport> {
        let inner = &self.inner;
        let stored = inner.credentials.list().await?;
        let preferred = inner.credentials.active().await?;
        let now = inner.clock.now();

        let mut report = RestoreReport::default();
        let mut sessions = Vec::new();
        for did in stored {
            match inner.credentials.get(&did).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    error!(account = %did, error = %e, "Failed to restore stored session");
                    report.failed.push((did, e));
                }
            }
        }

        let active = {
            let mut registry = inner.registry();
            for session in sessions {
                let did = session.did().clone();
                let state = if session.is_expired(now) {
                    SessionState::Expired
                } else {
                    SessionState::Active
                };
                registry.slots.insert(
                    did.clone(),
                    AccountSlot {
                        session,
                        state,
                        cancel: CancellationToken::new(),
                    },
                );
                report.restored.push(did);
            }
            registry.active = match preferred {
                Some(did) if registry.slots.contains_key(&did) => Some(did),
                _ => registry.next_active(),
            };
            registry.active.clone()
        };

        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            active = ?active,
            "Restored sessions"
        );
        if active.is_some() {
            inner.emit(SessionEvent::Switched(active));
        }
        Ok(report)
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Exchange the refresh credential for a new access credential.
    ///
    /// Concurrent callers for the same account share one exchange.
    pub async fn refresh(&self, did: &Did) -> SyncResult<Session> {
        let refresh = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match inflight.get(did) {
                Some(existing) => {
                    debug!(account = %did, "Joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let refresh_token = {
                        let mut registry = self.inner.registry();
                        let slot = registry
                            .slots
                            .get_mut(did)
                            .ok_or_else(|| SyncError::AccountNotSignedIn(did.clone()))?;
                        if !slot.state.can_refresh() {
                            return Err(SyncError::AccountNotSignedIn(did.clone()));
                        }
                        slot.state = SessionState::Refreshing;
                        slot.session.refresh_token.clone()
                    };

                    let inner = Arc::clone(&self.inner);
                    let owned_did = did.clone();
                    let refresh = async move {
                        let result = inner.run_refresh(&owned_did, refresh_token).await;
                        inner
                            .inflight
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&owned_did);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(did.clone(), refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    /// Refresh because `rejected_token` was refused by the service. When the
    /// session already carries a newer token (another caller rotated it),
    /// that session is returned without a new exchange.
    pub async fn refresh_rejected(&self, did: &Did, rejected_token: &str) -> SyncResult<Session> {
        {
            let registry = self.inner.registry();
            let slot = registry
                .slots
                .get(did)
                .ok_or_else(|| SyncError::AccountNotSignedIn(did.clone()))?;
            if slot.session.access_token != rejected_token && slot.state == SessionState::Active {
                debug!(account = %did, "Access token already rotated");
                return Ok(slot.session.clone());
            }
        }
        self.refresh(did).await
    }

    // =========================================================================
    // Switch / sign out
    // =========================================================================

    pub async fn switch_active(&self, did: &Did) -> SyncResult<()> {
        let changed = {
            let mut registry = self.inner.registry();
            if !registry.slots.contains_key(did) {
                return Err(SyncError::AccountNotSignedIn(did.clone()));
            }
            let changed = registry.active.as_ref() != Some(did);
            registry.active = Some(did.clone());
            changed
        };
        if changed {
            self.inner.credentials.set_active(Some(did)).await?;
            info!(account = %did, "Switched active account");
            self.inner.emit(SessionEvent::Switched(Some(did.clone())));
        }
        Ok(())
    }

    /// Sign the account out. Local invalidation always happens, even when
    /// the stored credential cannot be removed; server-side revocation is
    /// best-effort.
    pub async fn sign_out(&self, did: &Did) -> SyncResult<()> {
        let inner = &self.inner;
        let (slot, new_active, was_active) = {
            let mut registry = inner.registry();
            let slot = registry.slots.remove(did);
            let was_active = registry.active.as_ref() == Some(did);
            if was_active {
                registry.active = registry.next_active();
            }
            (slot, registry.active.clone(), was_active)
        };

        let Some(slot) = slot else {
            // Stored but never loaded, or left behind by an earlier sign-out
            if inner.credentials.contains(did).await? {
                inner.credentials.remove(did).await?;
                if inner.credentials.active().await?.as_ref() == Some(did) {
                    let active = inner.registry().active.clone();
                    inner.credentials.set_active(active.as_ref()).await?;
                }
                return Ok(());
            }
            return Err(SyncError::AccountNotSignedIn(did.clone()));
        };
        slot.cancel.cancel();
        info!(account = %did, "Signed out");
        inner.emit(SessionEvent::SignedOut(did.clone()));
        if was_active {
            inner.emit(SessionEvent::Switched(new_active.clone()));
        }

        let mut result = inner.credentials.remove(did).await;
        if result.is_ok() && was_active {
            result = inner.credentials.set_active(new_active.as_ref()).await;
        }
        if let Err(e) = &result {
            warn!(account = %did, error = %e, "Stored credential not removed, sign out again to retry");
        }

        if inner.connectivity.is_online() {
            match inner
                .with_timeout(inner.service.delete_session(&slot.session.refresh_token))
                .await
            {
                Ok(()) => debug!(account = %did, "Session revoked server-side"),
                Err(e) => warn!(account = %did, error = %e, "Server-side revocation failed"),
            }
        } else {
            debug!(account = %did, "Offline, skipping server-side revocation");
        }
        result
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CallError>>,
    ) -> Result<T, CallError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Transient(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    fn set_state(&self, did: &Did, state: SessionState) {
        if let Some(slot) = self.registry().slots.get_mut(did) {
            slot.state = state;
        }
    }

    async fn run_refresh(&self, did: &Did, refresh_token: String) -> SyncResult<Session> {
        let cancel = match self.registry().slots.get(did) {
            Some(slot) => slot.cancel.clone(),
            None => return Err(SyncError::AccountNotSignedIn(did.clone())),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if !self.connectivity.is_online() {
                return Err(self.expire(did, "offline".to_string()));
            }

            debug!(account = %did, attempt, "Refreshing session");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                outcome = self.with_timeout(self.service.refresh_session(&refresh_token)) => outcome,
            };

            match outcome {
                Ok(tokens) => {
                    let session = {
                        let mut registry = self.registry();
                        let slot = registry
                            .slots
                            .get_mut(did)
                            .ok_or_else(|| SyncError::AccountNotSignedIn(did.clone()))?;
                        slot.session.apply_refresh(tokens, self.clock.now());
                        slot.state = SessionState::Active;
                        slot.session.clone()
                    };
                    self.credentials.put(&session).await?;
                    info!(account = %did, "Session refreshed");
                    self.emit(SessionEvent::Active(did.clone()));
                    return Ok(session);
                }
                Err(CallError::Auth(msg)) | Err(CallError::Rejected { message: msg, .. }) => {
                    warn!(account = %did, error = %msg, "Refresh credential revoked, signing out");
                    return Err(self.revoke_locally(did).await);
                }
                Err(CallError::Transient(msg)) => {
                    if !self.refresh_backoff.allows_retry(attempt) {
                        warn!(account = %did, attempts = attempt, error = %msg, "Refresh failed, keeping previous credential");
                        return Err(self.expire(did, msg));
                    }
                    let delay = self.refresh_backoff.delay_for(attempt);
                    debug!(account = %did, attempt, delay_ms = delay.as_millis() as u64, "Refresh failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Land in `Expired`, keeping the previous access credential for reads.
    fn expire(&self, did: &Did, reason: String) -> SyncError {
        self.set_state(did, SessionState::Expired);
        self.emit(SessionEvent::Expired(did.clone()));
        SyncError::NetworkUnavailable(reason)
    }

    /// Irrecoverable refresh failure: drop the session and purge its stored
    /// credential.
    async fn revoke_locally(&self, did: &Did) -> SyncError {
        let (was_active, new_active) = {
            let mut registry = self.registry();
            if let Some(slot) = registry.slots.remove(did) {
                slot.cancel.cancel();
            }
            let was_active = registry.active.as_ref() == Some(did);
            if was_active {
                registry.active = registry.next_active();
            }
            (was_active, registry.active.clone())
        };

        if let Err(e) = self.credentials.remove(did).await {
            error!(account = %did, error = %e, "Failed to purge revoked credentials");
            return e;
        }
        if was_active {
            if let Err(e) = self.credentials.set_active(new_active.as_ref()).await {
                error!(error = %e, "Failed to persist active account");
                return e;
            }
        }
        self.emit(SessionEvent::SignedOut(did.clone()));
        if was_active {
            self.emit(SessionEvent::Switched(new_active));
        }
        SyncError::RefreshRevoked(did.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fixture, wait_until, ALICE_DID, BOB_DID};

    #[tokio::test]
    async fn test_sign_in_makes_first_account_active() {
        let f = fixture();
        let account = f.sessions.sign_in("alice.test", "hunter2", false).await.unwrap();
        assert_eq!(account.did, Did::new(ALICE_DID));
        assert_eq!(f.sessions.active_account(), Some(Did::new(ALICE_DID)));
        assert_eq!(f.sessions.state(&account.did), SessionState::Active);
        assert!(f.credentials.get(&account.did).await.is_ok());

        // Second account stays dormant unless requested
        f.sessions.sign_in("bob.test", "pw", false).await.unwrap();
        assert_eq!(f.sessions.active_account(), Some(Did::new(ALICE_DID)));
        f.sessions.sign_in("bob.test", "pw", true).await.unwrap();
        assert_eq!(f.sessions.active_account(), Some(Did::new(BOB_DID)));
        assert_eq!(f.sessions.accounts().len(), 2);
        assert_eq!(f.sessions.accounts()[0].did, Did::new(BOB_DID));
    }

    #[tokio::test]
    async fn test_sign_in_failures() {
        let f = fixture();
        let err = f.sessions.sign_in("alice.test", "wrong", true).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidCredential(_)));
        assert_eq!(f.sessions.state(&Did::new(ALICE_DID)), SessionState::SignedOut);
        assert!(!f.sessions.is_authenticating("alice.test"));

        f.connectivity.set_online(false);
        let err = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable(_)));
        assert_eq!(f.service.sessions_created(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_storage_failure_is_surfaced() {
        let f = fixture();
        f.storage.set_unavailable(true);
        let err = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap_err();
        assert!(matches!(err, SyncError::StorageUnavailable(_)));
        assert_eq!(f.sessions.active_account(), None);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;

        f.service.hold_refresh();
        let a = tokio::spawn({
            let sessions = f.sessions.clone();
            let did = did.clone();
            async move { sessions.refresh(&did).await }
        });
        wait_until(|| f.service.refresh_count() == 1).await;
        assert_eq!(f.sessions.state(&did), SessionState::Refreshing);

        let b = f.sessions.refresh(&did);
        tokio::pin!(b);
        assert!(futures::poll!(b.as_mut()).is_pending());
        f.service.release_refresh();

        let b = b.await.unwrap();
        let a = a.await.unwrap().unwrap();
        assert_eq!(f.service.refresh_count(), 1);
        assert_eq!(a.access_token, b.access_token);
        assert_eq!(f.sessions.state(&did), SessionState::Active);
        assert_eq!(f.credentials.get(&did).await.unwrap().access_token, a.access_token);
    }

    #[tokio::test]
    async fn test_refresh_revoked_signs_out_and_purges() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        let mut events = f.sessions.subscribe();

        f.service.revoke_refresh_tokens();
        let err = f.sessions.refresh(&did).await.unwrap_err();
        assert_eq!(err, SyncError::RefreshRevoked(did.clone()));
        assert_eq!(f.sessions.state(&did), SessionState::SignedOut);
        assert_eq!(f.sessions.active_account(), None);
        assert!(matches!(f.credentials.get(&did).await, Err(SyncError::NotFound(_))));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SignedOut(did.clone()));
    }

    #[tokio::test]
    async fn test_refresh_network_failure_keeps_previous_credential() {
        let f = fixture();
        let session = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap();
        let before = f.sessions.session(&session.did).unwrap();

        f.service.fail_refresh_transiently(10);
        let err = f.sessions.refresh(&session.did).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable(_)));
        assert_eq!(f.sessions.state(&session.did), SessionState::Expired);
        // Bounded by the refresh backoff policy
        assert_eq!(f.service.refresh_count(), 3);
        assert_eq!(
            f.sessions.session(&session.did).unwrap().access_token,
            before.access_token
        );

        // Expired sessions may refresh again once the service recovers
        f.service.fail_refresh_transiently(0);
        f.sessions.refresh(&session.did).await.unwrap();
        assert_eq!(f.sessions.state(&session.did), SessionState::Active);
    }

    #[tokio::test]
    async fn test_refresh_offline_does_not_touch_network() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        f.connectivity.set_online(false);
        let err = f.sessions.refresh(&did).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable(_)));
        assert_eq!(f.service.refresh_count(), 0);
        assert_eq!(f.sessions.state(&did), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_refresh_requires_signed_in_account() {
        let f = fixture();
        let err = f.sessions.refresh(&Did::new(ALICE_DID)).await.unwrap_err();
        assert_eq!(err, SyncError::AccountNotSignedIn(Did::new(ALICE_DID)));
    }

    #[tokio::test]
    async fn test_refresh_rejected_skips_when_already_rotated() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        let old = f.sessions.session(&did).unwrap().access_token;
        f.sessions.refresh(&did).await.unwrap();
        assert_eq!(f.service.refresh_count(), 1);

        let session = f.sessions.refresh_rejected(&did, &old).await.unwrap();
        assert_ne!(session.access_token, old);
        assert_eq!(f.service.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_switch_active() {
        let f = fixture();
        f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap();
        f.sessions.sign_in("bob.test", "pw", false).await.unwrap();

        f.sessions.switch_active(&Did::new(BOB_DID)).await.unwrap();
        assert_eq!(f.sessions.active_account(), Some(Did::new(BOB_DID)));
        assert_eq!(f.credentials.active().await.unwrap(), Some(Did::new(BOB_DID)));

        let err = f
            .sessions
            .switch_active(&Did::new("did:plc:nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AccountNotSignedIn(_)));
        assert_eq!(f.service.call_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_out_round_trip() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        let token = f.sessions.cancellation_token(&did).unwrap();

        f.sessions.sign_out(&did).await.unwrap();
        assert!(matches!(f.credentials.get(&did).await, Err(SyncError::NotFound(_))));
        assert_eq!(f.sessions.state(&did), SessionState::SignedOut);
        assert_eq!(f.sessions.active_account(), None);
        assert!(token.is_cancelled());
        assert_eq!(f.service.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_offline_still_invalidates_locally() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        f.sessions.sign_in("bob.test", "pw", false).await.unwrap();
        f.connectivity.set_online(false);

        f.sessions.sign_out(&did).await.unwrap();
        assert_eq!(f.service.delete_count(), 0);
        assert!(matches!(f.credentials.get(&did).await, Err(SyncError::NotFound(_))));
        assert_eq!(f.sessions.active_account(), Some(Did::new(BOB_DID)));
    }

    #[tokio::test]
    async fn test_sign_out_with_storage_down_still_invalidates_locally() {
        let f = fixture();
        let did = f.sessions.sign_in("alice.test", "hunter2", true).await.unwrap().did;
        let token = f.sessions.cancellation_token(&did).unwrap();
        let mut events = f.sessions.subscribe();
        f.storage.set_unavailable(true);

        let err = f.sessions.sign_out(&did).await.unwrap_err();
        assert!(matches!(err, SyncError::StorageUnavailable(_)));
        assert!(token.is_cancelled());
        assert_eq!(f.sessions.state(&did), SessionState::SignedOut);
        assert_eq!(f.sessions.active_account(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedOut(did.clone()));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Switched(None));

        // Signing out again once storage is back clears the stored credential
        f.storage.set_unavailable(false);
        f.sessions.sign_out(&did).await.unwrap();
        assert!(matches!(f.credentials.get(&did).await, Err(SyncError::NotFound(_))));
        assert_eq!(f.credentials.active().await.unwrap(), None);
        assert!(f.new_session_manager().restore().await.unwrap().restored.is_empty());
    }

    #[tokio::test]
    async fn test_restore_resumes_stored_sessions() {
        let f = fixture();
        f.sessions.sign_in("alice.test", "hunter2", false).await.unwrap();
        f.sessions.sign_in("bob.test", "pw", true).await.unwrap();

        let restored = f.new_session_manager();
        let report = restored.restore().await.unwrap();
        assert_eq!(report.restored.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(restored.active_account(), Some(Did::new(BOB_DID)));
        assert_eq!(restored.state(&Did::new(ALICE_DID)), SessionState::Active);

        f.clock.advance(chrono::Duration::days(1));
        assert_eq!(restored.state(&Did::new(ALICE_DID)), SessionState::Expired);
    }
}
