//! Authentication module for managing accounts, sessions and credentials.
//!
//! This module provides:
//! - `SessionManager`: per-account session state machine, single-flight
//!   refresh, account switching and sign-out
//! - `CredentialStore`: encrypted, durable storage of sessions
//! - `CredentialCipher`: ChaCha20-Poly1305 keyed from the OS keychain or a
//!   passphrase

pub mod account;
pub mod cipher;
pub mod credentials;
pub mod manager;
pub mod session;

pub use account::{Account, Did};
pub use cipher::CredentialCipher;
pub use credentials::CredentialStore;
pub use manager::{RestoreReport, SessionEvent, SessionManager};
pub use session::{Session, SessionState, SessionTokens};
