use async_trait::async_trait;
use serde_json::Value;

use super::{CallError, Operation};
use crate::auth::SessionTokens;

/// The remote protocol service. Implementations only need to classify
/// failures into the three [`CallError`] outcome classes.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Exchange an identifier and secret for a new session.
    async fn create_session(&self, identifier: &str, secret: &str)
        -> Result<SessionTokens, CallError>;

    /// Exchange a refresh credential for a new access credential.
    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, CallError>;

    /// Revoke the session server-side.
    async fn delete_session(&self, refresh_token: &str) -> Result<(), CallError>;

    async fn call(&self, operation: &Operation, access_token: Option<&str>)
        -> Result<Value, CallError>;

    /// Service URL recorded on accounts that authenticate through it.
    fn service_url(&self) -> &str;
}
