//! At-rest encryption for stored credentials.
//!
//! Blob format: `[nonce: 12 bytes][ciphertext + tag]`. The account DID is
//! bound as associated data, so a blob copied under another account's key
//! fails authentication.

use std::fmt;

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use keyring::Entry;
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

/// Nonce length for ChaCha20-Poly1305 (96 bits)
const NONCE_LEN: usize = 12;

/// AEAD tag length
const TAG_LEN: usize = 16;

/// 256-bit key
const KEY_LEN: usize = 32;

/// Keychain account name under which the data key is kept
const KEYRING_KEY_NAME: &str = "credential-key";

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Derive the key from a passphrase with Argon2id. `salt` must be at
    /// least 8 bytes.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> SyncResult<Self> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| SyncError::StorageUnavailable(format!("Key derivation failed: {}", e)))?;
        Ok(Self::from_key(&key))
    }

    /// Load the data key from the OS keychain, generating and storing a
    /// random one on first use.
    pub fn from_keyring(service: &str) -> SyncResult<Self> {
        let entry = Entry::new(service, KEYRING_KEY_NAME).map_err(|e| {
            SyncError::StorageUnavailable(format!("Failed to create keyring entry: {}", e))
        })?;

        match entry.get_secret() {
            Ok(secret) if secret.len() == KEY_LEN => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&secret);
                debug!("Loaded credential key from keychain");
                Ok(Self::from_key(&key))
            }
            Ok(_) => Err(SyncError::StorageUnavailable(
                "Credential key in keychain has unexpected length".to_string(),
            )),
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                entry.set_secret(&key).map_err(|e| {
                    SyncError::StorageUnavailable(format!(
                        "Failed to store credential key in keychain: {}",
                        e
                    ))
                })?;
                info!("Generated new credential key in keychain");
                Ok(Self::from_key(&key))
            }
            Err(e) => Err(SyncError::StorageUnavailable(format!(
                "Failed to read credential key from keychain: {}",
                e
            ))),
        }
    }

    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> SyncResult<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|e| SyncError::StorageUnavailable(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8], associated_data: &[u8]) -> SyncResult<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(SyncError::StorageUnavailable(
                "Credential blob truncated".to_string(),
            ));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| {
                SyncError::StorageUnavailable(
                    "Credential blob failed authentication (wrong key or corrupted)".to_string(),
                )
            })
    }
}
