use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::{CredentialCipher, Did, Session};
use crate::error::{SyncError, SyncResult};
use crate::storage::StorageBackend;

/// Storage key prefix for encrypted sessions
const CREDENTIAL_PREFIX: &str = "credentials/";

/// Storage key for the active account pointer
const ACTIVE_ACCOUNT_KEY: &str = "session/active";

/// Encrypted, durable store of account sessions.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn StorageBackend>,
    cipher: CredentialCipher,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn StorageBackend>, cipher: CredentialCipher) -> Self {
        Self { storage, cipher }
    }

    fn key_for(did: &Did) -> String {
        format!("{}{}", CREDENTIAL_PREFIX, did)
    }

    /// Store the session for its account, replacing any previous one.
    pub async fn put(&self, session: &Session) -> SyncResult<()> {
        let did = session.did();
        let plaintext = serde_json::to_vec(session)?;
        let blob = self.cipher.seal(&plaintext, did.as_str().as_bytes())?;
        self.storage.put(&Self::key_for(did), &blob).await?;
        debug!(account = %did, "Stored credentials");
        Ok(())
    }

    pub async fn get(&self, did: &Did) -> SyncResult<Session> {
        let blob = self
            .storage
            .get(&Self::key_for(did))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("credentials for {}", did)))?;
        let plaintext = self.cipher.open(&blob, did.as_str().as_bytes())?;
        let session: Session = serde_json::from_slice(&plaintext).map_err(|e| {
            SyncError::StorageUnavailable(format!("Stored credentials for {} unreadable: {}", did, e))
        })?;
        Ok(session)
    }

    pub async fn contains(&self, did: &Did) -> SyncResult<bool> {
        Ok(self.storage.get(&Self::key_for(did)).await?.is_some())
    }

    pub async fn remove(&self, did: &Did) -> SyncResult<()> {
        self.storage.delete(&Self::key_for(did)).await?;
        debug!(account = %did, "Removed credentials");
        Ok(())
    }

    pub async fn list(&self) -> SyncResult<BTreeSet<Did>> {
        let keys = self.storage.list(CREDENTIAL_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(CREDENTIAL_PREFIX))
            .map(Did::new)
            .collect())
    }

    pub async fn active(&self) -> SyncResult<Option<Did>> {
        match self.storage.get(ACTIVE_ACCOUNT_KEY).await? {
            Some(bytes) => Ok(Some(Did::new(String::from_utf8_lossy(&bytes).into_owned()))),
            None => Ok(None),
        }
    }

    pub async fn set_active(&self, did: Option<&Did>) -> SyncResult<()> {
        match did {
            Some(did) => self
                .storage
                .put(ACTIVE_ACCOUNT_KEY, did.as_str().as_bytes())
                .await?,
            None => self.storage.delete(ACTIVE_ACCOUNT_KEY).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionTokens;
    use crate::storage::MemoryStorage;
    use chrono::Utc;

    fn session(did: &str) -> Session {
        Session::from_tokens(
            SessionTokens {
                did: Did::new(did),
                handle: format!("{}.test", did),
                email: None,
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                expires_at: None,
            },
            "https://pds.test",
            Utc::now(),
        )
    }

    fn store() -> (Arc<MemoryStorage>, CredentialStore) {
        let storage = Arc::new(MemoryStorage::new());
        let cipher = CredentialCipher::from_key(&[7u8; 32]);
        (storage.clone(), CredentialStore::new(storage, cipher))
    }

    #[tokio::test]
    async fn test_put_get_list_remove() {
        let (_, store) = store();
        store.put(&session("did:plc:alice")).await.unwrap();
        store.put(&session("did:plc:bob")).await.unwrap();

        let alice = store.get(&Did::new("did:plc:alice")).await.unwrap();
        assert_eq!(alice.refresh_token, "refresh");

        let listed: Vec<_> = store.list().await.unwrap().into_iter().collect();
        assert_eq!(listed, vec![Did::new("did:plc:alice"), Did::new("did:plc:bob")]);

        store.remove(&Did::new("did:plc:alice")).await.unwrap();
        assert!(matches!(
            store.get(&Did::new("did:plc:alice")).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_values_are_encrypted_at_rest() {
        let (storage, store) = store();
        store.put(&session("did:plc:alice")).await.unwrap();
        let raw = storage.get("credentials/did:plc:alice").await.unwrap().unwrap();
        let raw = String::from_utf8_lossy(&raw);
        assert!(!raw.contains("refresh"));
        assert!(!raw.contains("alice.test"));
    }

    #[tokio::test]
    async fn test_storage_failure_is_surfaced() {
        let (storage, store) = store();
        storage.set_unavailable(true);
        assert!(matches!(
            store.put(&session("did:plc:alice")).await,
            Err(SyncError::StorageUnavailable(_))
        ));
        assert!(matches!(
            store.get(&Did::new("did:plc:alice")).await,
            Err(SyncError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_active_pointer() {
        let (_, store) = store();
        assert_eq!(store.active().await.unwrap(), None);
        store.set_active(Some(&Did::new("did:plc:bob"))).await.unwrap();
        assert_eq!(store.active().await.unwrap(), Some(Did::new("did:plc:bob")));
        store.set_active(None).await.unwrap();
        assert_eq!(store.active().await.unwrap(), None);
    }
}
