//! Persisted query cache with stale-while-revalidate reads.
//!
//! Entries live in memory behind a read-write lock and are mirrored to the
//! storage backend under `cache/<key>`. Writes to one key are serialized by a
//! per-key async lock; the map lock is only held for the final swap, so reads
//! never wait on a write to another key.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheEvent, CacheEventKind, CacheKey, CacheSource, Freshness, Lookup, Query};
use crate::api::RequestPipeline;
use crate::auth::Did;
use crate::clock::Clock;
use crate::config::CachePolicy;
use crate::error::{SyncError, SyncResult};
use crate::storage::StorageBackend;

/// Storage key prefix for cache entries
const CACHE_PREFIX: &str = "cache/";

type Callback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<CacheKey>,
    pub revalidations_scheduled: usize,
}

struct Subscriber {
    id: u64,
    key: CacheKey,
    callback: Callback,
}

struct CacheInner {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    pipeline: RequestPipeline,
    policy: CachePolicy,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    write_locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Highest version ever issued per key, so a re-put after invalidation
    /// never reuses a version.
    versions: Mutex<HashMap<CacheKey, u64>>,
    /// Keys with a revalidation in flight. These are pinned against eviction.
    revalidating: Mutex<HashSet<CacheKey>>,
    /// Keys whose last revalidation failed.
    retry: Mutex<HashSet<CacheKey>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    revalidations_started: AtomicU64,
}

#[derive(Clone)]
pub struct PersistedCache {
    inner: Arc<CacheInner>,
}

fn storage_key(key: &CacheKey) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PersistedCache {
    /// Load every persisted entry. Unreadable entries are dropped from
    /// storage rather than failing the whole cache.
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        pipeline: RequestPipeline,
        policy: CachePolicy,
    ) -> SyncResult<Self> {
        let mut entries = HashMap::new();
        for key in storage.list(CACHE_PREFIX).await? {
            let Some(bytes) = storage.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => {
                    entries.insert(entry.key.clone(), entry);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping unreadable cache entry");
                    storage.delete(&key).await?;
                }
            }
        }
        info!(entries = entries.len(), "Cache loaded");

        let versions = entries
            .values()
            .map(|e| (e.key.clone(), e.version))
            .collect();
        Ok(Self {
            inner: Arc::new(CacheInner {
                storage,
                clock,
                pipeline,
                policy,
                entries: RwLock::new(entries),
                write_locks: Mutex::new(HashMap::new()),
                versions: Mutex::new(versions),
                revalidating: Mutex::new(HashSet::new()),
                retry: Mutex::new(HashSet::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                revalidations_started: AtomicU64::new(0),
            }),
        })
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `key`. A stale entry with a source schedules one background
    /// revalidation; the stale value is returned regardless.
    pub fn get(&self, key: &CacheKey) -> Lookup {
        let now = self.inner.clock.now();
        let Some(entry) = self.inner.entries().get(key).cloned() else {
            return Lookup::absent();
        };
        let freshness = entry.freshness(now);
        if freshness == Freshness::StaleButUsable {
            self.inner.schedule_revalidation(&entry);
        }
        Lookup {
            freshness,
            entry: Some(entry),
        }
    }

    /// Read-through: the cached value when there is one, otherwise fetch via
    /// the pipeline and install the result.
    pub async fn fetch(&self, query: &Query) -> SyncResult<Lookup> {
        let lookup = self.get(&query.key);
        if lookup.freshness != Freshness::Absent {
            return Ok(lookup);
        }

        // Pin the account now so revalidation never runs as whoever is
        // active later
        let account = query
            .account
            .clone()
            .or_else(|| self.inner.pipeline.sessions().active_account());
        let value = self
            .inner
            .pipeline
            .execute(&query.operation, account.as_ref())
            .await?;
        let stale_after = query
            .stale_after
            .unwrap_or_else(|| self.inner.policy.stale_after_for(query.key.domain()));
        let source = CacheSource {
            operation: query.operation.clone(),
            account,
        };
        let entry = self
            .put_with_source(query.key.clone(), value, stale_after, source)
            .await?;
        Ok(Lookup {
            freshness: Freshness::Fresh,
            entry: Some(entry),
        })
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.inner.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_revalidating(&self, key: &CacheKey) -> bool {
        lock(&self.inner.revalidating).contains(key)
    }

    /// Total revalidations scheduled since open.
    pub fn revalidations_started(&self) -> u64 {
        self.inner.revalidations_started.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Install a value without a source; it cannot be revalidated and is
    /// served stale until replaced.
    pub async fn put(&self, key: CacheKey, value: Value, stale_after: Duration) -> SyncResult<CacheEntry> {
        self.inner
            .write(key.clone(), value, stale_after, None, None)
            .await?
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    pub async fn put_with_source(
        &self,
        key: CacheKey,
        value: Value,
        stale_after: Duration,
        source: CacheSource,
    ) -> SyncResult<CacheEntry> {
        self.inner
            .write(key.clone(), value, stale_after, Some(source), None)
            .await?
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    /// Replace the entry only if it is still at `expected` version.
    /// `Ok(None)` means another writer got there first.
    pub async fn put_if_version(
        &self,
        key: CacheKey,
        value: Value,
        expected: u64,
    ) -> SyncResult<Option<CacheEntry>> {
        let (stale_after, source) = match self.inner.entries().get(&key) {
            Some(entry) => (entry.stale_after(), entry.source.clone()),
            None => return Ok(None),
        };
        self.inner
            .write(key, value, stale_after, source, Some(expected))
            .await
    }

    pub async fn invalidate(&self, key: &CacheKey) -> SyncResult<bool> {
        let removed = self
            .inner
            .remove_if(key, CacheEventKind::Invalidated, |_| true)
            .await?;
        if removed {
            debug!(key = %key, "Invalidated");
        }
        Ok(removed)
    }

    /// Invalidate every key in `domain`. Returns how many were removed.
    pub async fn invalidate_domain(&self, domain: &str) -> SyncResult<usize> {
        let keys: Vec<CacheKey> = self
            .inner
            .entries()
            .keys()
            .filter(|k| k.domain() == domain)
            .cloned()
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.invalidate(&key).await? {
                removed += 1;
            }
        }
        debug!(domain, removed, "Invalidated domain");
        Ok(removed)
    }

    /// Drop entries fetched on behalf of `did`.
    pub async fn purge_account(&self, did: &Did) -> SyncResult<usize> {
        let keys: Vec<CacheKey> = self
            .inner
            .entries()
            .values()
            .filter(|e| e.source.as_ref().and_then(|s| s.account.as_ref()) == Some(did))
            .map(|e| e.key.clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.invalidate(&key).await? {
                removed += 1;
            }
        }
        info!(account = %did, removed, "Purged cached entries");
        Ok(removed)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict entries past the retention ceiling and reschedule failed
    /// revalidations.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let retention = inner.policy.retention();
        let expired_at = move |e: &CacheEntry| e.age(now) > retention;

        let candidates: Vec<CacheKey> = inner
            .entries()
            .values()
            .filter(|e| expired_at(e))
            .map(|e| e.key.clone())
            .collect();

        let mut report = SweepReport::default();
        for key in candidates {
            let pinned = |k: &CacheKey| lock(&inner.revalidating).contains(k);
            let removed = inner
                .remove_if(&key, CacheEventKind::Evicted, |e| {
                    expired_at(e) && !pinned(&e.key)
                })
                .await?;
            if removed {
                report.evicted.push(key);
            } else {
                debug!(key = %key, "Skipping eviction of pinned entry");
            }
        }

        let retry: Vec<CacheKey> = lock(&inner.retry).iter().cloned().collect();
        for key in retry {
            let entry = inner.entries().get(&key).cloned();
            match entry {
                Some(entry) if entry.is_stale(now) => {
                    if inner.schedule_revalidation(&entry) {
                        report.revalidations_scheduled += 1;
                    }
                }
                _ => {
                    lock(&inner.retry).remove(&key);
                }
            }
        }

        if !report.evicted.is_empty() || report.revalidations_scheduled > 0 {
            info!(
                evicted = report.evicted.len(),
                revalidations = report.revalidations_scheduled,
                "Cache sweep"
            );
        }
        Ok(report)
    }

    /// Run `sweep` every `policy.sweep_interval()` until `shutdown` fires.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.policy.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = cache.sweep().await {
                            warn!(error = %e, "Cache sweep failed");
                        }
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Call `callback` after every change to `key`. Callbacks run on the
    /// writer's task, outside the cache's locks.
    pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push(Subscriber {
            id,
            key,
            callback: Arc::new(callback),
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.inner.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id.0);
        subscribers.len() != before
    }
}

impl CacheInner {
    fn entries(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.write_locks)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the per-key lock once nobody else holds or waits on it.
    fn release_write_lock(&self, key: &CacheKey, key_lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = lock(&self.write_locks);
        // One reference in the map, one here
        if Arc::strong_count(&key_lock) == 2 {
            locks.remove(key);
        }
    }

    fn notify(&self, event: CacheEvent) {
        let callbacks: Vec<Callback> = lock(&self.subscribers)
            .iter()
            .filter(|s| s.key == event.key)
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Persist then swap in a new entry. With `expected` set, the write only
    /// happens if the current version matches.
    async fn write(
        &self,
        key: CacheKey,
        value: Value,
        stale_after: Duration,
        source: Option<CacheSource>,
        expected: Option<u64>,
    ) -> SyncResult<Option<CacheEntry>> {
        let key_lock = self.write_lock(&key);
        let guard = key_lock.lock().await;
        let written = self
            .swap_entry(&key, value, stale_after, source, expected)
            .await;
        drop(guard);
        self.release_write_lock(&key, key_lock);

        let Some(entry) = written? else {
            return Ok(None);
        };
        lock(&self.retry).remove(&key);
        self.notify(CacheEvent {
            key,
            kind: CacheEventKind::Updated {
                version: entry.version,
            },
        });
        Ok(Some(entry))
    }

    /// Caller holds the key's write lock.
    async fn swap_entry(
        &self,
        key: &CacheKey,
        value: Value,
        stale_after: Duration,
        source: Option<CacheSource>,
        expected: Option<u64>,
    ) -> SyncResult<Option<CacheEntry>> {
        let current = self.entries().get(key).map(|e| e.version);
        if let Some(expected) = expected {
            if current != Some(expected) {
                return Ok(None);
            }
        }

        let issued = lock(&self.versions).get(key).copied().unwrap_or(0);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            fetched_at: self.clock.now(),
            stale_after_ms: u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX),
            version: issued.max(current.unwrap_or(0)) + 1,
            source,
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.storage.put(&storage_key(key), &bytes).await?;

        self.entries_mut().insert(key.clone(), entry.clone());
        lock(&self.versions).insert(key.clone(), entry.version);
        Ok(Some(entry))
    }

    async fn remove_if(
        &self,
        key: &CacheKey,
        kind: CacheEventKind,
        predicate: impl Fn(&CacheEntry) -> bool,
    ) -> SyncResult<bool> {
        let key_lock = self.write_lock(key);
        let guard = key_lock.lock().await;
        let removed = self.remove_locked(key, predicate).await;
        drop(guard);
        self.release_write_lock(key, key_lock);

        if !removed? {
            return Ok(false);
        }
        lock(&self.retry).remove(key);
        self.notify(CacheEvent {
            key: key.clone(),
            kind,
        });
        Ok(true)
    }

    /// Caller holds the key's write lock.
    async fn remove_locked(
        &self,
        key: &CacheKey,
        predicate: impl Fn(&CacheEntry) -> bool,
    ) -> SyncResult<bool> {
        let matches = self.entries().get(key).map(&predicate).unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        self.storage.delete(&storage_key(key)).await?;
        self.entries_mut().remove(key);
        Ok(true)
    }

    /// Start a background revalidation for `entry` unless one is already in
    /// flight. Returns whether one was started.
    fn schedule_revalidation(self: &Arc<Self>, entry: &CacheEntry) -> bool {
        let Some(source) = entry.source.clone() else {
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %entry.key, "No runtime, not revalidating");
            return false;
        };
        let cancel = match source.account {
            Some(ref did) => match self.pipeline.sessions().cancellation_token(did) {
                Some(token) => token,
                None => {
                    debug!(key = %entry.key, account = %did, "Account signed out, not revalidating");
                    return false;
                }
            },
            None => CancellationToken::new(),
        };
        if !lock(&self.revalidating).insert(entry.key.clone()) {
            return false;
        }
        self.revalidations_started.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        let key = entry.key.clone();
        let version = entry.version;
        let stale_after = entry.stale_after();
        runtime.spawn(async move {
            inner
                .revalidate(&key, version, stale_after, source, cancel)
                .await;
            lock(&inner.revalidating).remove(&key);
        });
        true
    }

    async fn revalidate(
        &self,
        key: &CacheKey,
        version: u64,
        stale_after: Duration,
        source: CacheSource,
        cancel: CancellationToken,
    ) {
        debug!(key = %key, version, "Revalidating");
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(key = %key, "Revalidation abandoned");
                return;
            }
            result = self.pipeline.execute(&source.operation, source.account.as_ref()) => result,
        };

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Revalidation failed, keeping stale value");
                lock(&self.retry).insert(key.clone());
                return;
            }
        };
        if cancel.is_cancelled() {
            debug!(key = %key, "Revalidation abandoned");
            return;
        }

        match self
            .write(key.clone(), value, stale_after, Some(source), Some(version))
            .await
        {
            Ok(Some(entry)) => debug!(key = %key, version = entry.version, "Revalidated"),
            Ok(None) => debug!(key = %key, "Entry changed during revalidation, discarding result"),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to store revalidated entry");
                lock(&self.retry).insert(key.clone());
            }
        }
    }
}
