use thiserror::Error;

use crate::auth::Did;

/// Error kinds surfaced by the session, cache and queue layers.
///
/// Clone is required because a single-flight refresh shares its outcome with
/// every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Invalid credentials: {0}")]
    InvalidCredential(String),

    #[error("Refresh credential revoked for {0} - sign in again")]
    RefreshRevoked(Did),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Account not signed in: {0}")]
    AccountNotSignedIn(Did),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected ({error}): {message}")]
    Rejected { error: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether a queued mutation failing with this error should be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_) | SyncError::ServiceUnavailable(_)
        )
    }

    /// Errors that can only be resolved by the user signing in again.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidCredential(_) | SyncError::RefreshRevoked(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
