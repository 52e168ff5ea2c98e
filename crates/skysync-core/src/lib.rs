//! Core session, credential and offline cache engine for skysync.
//!
//! This crate contains the account/session layer, the request pipeline,
//! the persisted cache and the mutation queue, independent of any UI.

pub mod api;
pub mod auth;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod queue;
pub mod storage;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use api::{CallError, Operation, OperationKind, RemoteService, RequestPipeline, XrpcService};
pub use auth::{Account, CredentialCipher, Did, Session, SessionEvent, SessionManager, SessionState};
pub use cache::{CacheKey, Freshness, Lookup, PersistedCache, Query};
pub use client::{SyncClient, SyncClientBuilder};
pub use clock::{Clock, Connectivity, ManualClock, SystemClock};
pub use config::{Config, SyncPolicy};
pub use error::{SyncError, SyncResult};
pub use queue::{Invalidation, MutationQueue, MutationStatus, QueuedMutation};
pub use storage::{FileStorage, MemoryStorage, StorageBackend};
