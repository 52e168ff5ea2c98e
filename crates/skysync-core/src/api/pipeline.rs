//! Request pipeline: every outbound call goes through here.
//!
//! Attaches the account's access credential, refreshes once on an
//! authorization failure, and retries transient failures with bounded
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{CallError, Operation, RemoteService};
use crate::auth::{Did, SessionManager};
use crate::backoff::BackoffPolicy;
use crate::clock::Connectivity;
use crate::error::{SyncError, SyncResult};

#[derive(Clone)]
pub struct RequestPipeline {
    service: Arc<dyn RemoteService>,
    sessions: SessionManager,
    connectivity: Connectivity,
    retry: BackoffPolicy,
    timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        service: Arc<dyn RemoteService>,
        sessions: SessionManager,
        connectivity: Connectivity,
        retry: BackoffPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            sessions,
            connectivity,
            retry,
            timeout,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Execute `operation` as `account` (or the active account when `None`).
    ///
    /// Without any signed-in account the call goes out unauthenticated.
    pub async fn execute(&self, operation: &Operation, account: Option<&Did>) -> SyncResult<Value> {
        let Some(mut session) = self.sessions.resolve(account)? else {
            return self
                .call_with_retry(operation, None)
                .await
                .map_err(|e| self.surface(e));
        };
        let did = session.did().clone();

        // Proactive refresh of an already-expired token. If it cannot be
        // renewed right now the old token is still tried.
        if session.is_expired(self.sessions.clock().now()) {
            match self.sessions.refresh(&did).await {
                Ok(fresh) => session = fresh,
                Err(SyncError::NetworkUnavailable(reason)) => {
                    debug!(account = %did, reason = %reason, "Expired token not renewed, trying it anyway");
                }
                Err(e) => return Err(e),
            }
        }

        let token = session.access_token.clone();
        match self.call_with_retry(operation, Some(&token)).await {
            Err(CallError::Auth(reason)) => {
                debug!(account = %did, op = %operation, reason = %reason, "Authorization failed, refreshing once");
                let refreshed = self.sessions.refresh_rejected(&did, &token).await?;
                match self
                    .call_with_retry(operation, Some(&refreshed.access_token))
                    .await
                {
                    Err(CallError::Auth(reason)) => {
                        warn!(account = %did, op = %operation, "Authorization failed after refresh");
                        Err(SyncError::Unauthorized(reason))
                    }
                    other => other.map_err(|e| self.surface(e)),
                }
            }
            other => other.map_err(|e| self.surface(e)),
        }
    }

    /// Transient failures while offline are reported as `NetworkUnavailable`;
    /// otherwise the service kept failing and it is `ServiceUnavailable`.
    fn surface(&self, e: CallError) -> SyncError {
        match e {
            CallError::Transient(reason) if !self.connectivity.is_online() => {
                SyncError::NetworkUnavailable(reason)
            }
            other => other.into(),
        }
    }

    /// One logical call: transient failures and timeouts are retried up to
    /// the policy's attempt limit, then surfaced as `Transient`.
    async fn call_with_retry(
        &self,
        operation: &Operation,
        token: Option<&str>,
    ) -> Result<Value, CallError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !self.connectivity.is_online() {
                return Err(CallError::Transient("offline".to_string()));
            }

            let outcome = match tokio::time::timeout(self.timeout, self.service.call(operation, token)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::Transient(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                ))),
            };

            match outcome {
                Err(CallError::Transient(reason)) if self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(op = %operation, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "Transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
