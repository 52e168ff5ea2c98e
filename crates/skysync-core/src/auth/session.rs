use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Account, Did};

/// Access token lifetime assumed when the service does not report one.
const DEFAULT_TOKEN_LIFETIME_MINUTES: i64 = 120;

/// Buffer before expiry at which a session is considered due for refresh.
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Per-account lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    SignedOut,
    Authenticating,
    Active,
    Refreshing,
    Expired,
}

impl SessionState {
    pub fn can_refresh(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Expired)
    }
}

/// Tokens handed back by a successful create/refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub did: Did,
    pub handle: String,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account: Account,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
    pub refreshed_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("expires_at", &self.expires_at)
            .field("valid", &self.valid)
            .field("refreshed_at", &self.refreshed_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn from_tokens(tokens: SessionTokens, service: &str, now: DateTime<Utc>) -> Self {
        let expires_at = tokens
            .expires_at
            .unwrap_or_else(|| now + Duration::minutes(DEFAULT_TOKEN_LIFETIME_MINUTES));
        Self {
            account: Account {
                did: tokens.did,
                handle: tokens.handle,
                email: tokens.email,
                service: service.to_string(),
            },
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            valid: true,
            refreshed_at: now,
        }
    }

    /// Replace credentials in place after a refresh. Identity is preserved
    /// even if the service reports a different handle.
    pub fn apply_refresh(&mut self, tokens: SessionTokens, now: DateTime<Utc>) {
        self.access_token = tokens.access_token;
        self.refresh_token = tokens.refresh_token;
        self.expires_at = tokens
            .expires_at
            .unwrap_or_else(|| now + Duration::minutes(DEFAULT_TOKEN_LIFETIME_MINUTES));
        if !tokens.handle.is_empty() {
            self.account.handle = tokens.handle;
        }
        if tokens.email.is_some() {
            self.account.email = tokens.email;
        }
        self.valid = true;
        self.refreshed_at = now;
    }

    pub fn did(&self) -> &Did {
        &self.account.did
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes().max(0)
    }
}
