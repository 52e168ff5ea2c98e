pub mod entry;
pub mod manager;

pub use entry::{CacheEntry, CacheEvent, CacheEventKind, CacheKey, CacheSource, Freshness, Lookup, Query};
pub use manager::{PersistedCache, SubscriptionId, SweepReport};
