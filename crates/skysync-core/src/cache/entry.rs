use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::Operation;
use crate::auth::Did;

/// Separator between key segments (`feed:home`).
const KEY_SEPARATOR: char = ':';

/// Deterministic key of a query: its domain followed by its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(domain: &str, params: &[&str]) -> Self {
        let mut key = domain.to_string();
        for param in params {
            key.push(KEY_SEPARATOR);
            key.push_str(param);
        }
        Self(key)
    }

    pub fn parse(key: &str) -> Self {
        Self(key.to_string())
    }

    /// First segment of the key, used for per-domain policy and
    /// domain-wide invalidation.
    pub fn domain(&self) -> &str {
        self.0.split(KEY_SEPARATOR).next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to fetch the entry again during revalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSource {
    pub operation: Operation,
    pub account: Option<Did>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub fetched_at: DateTime<Utc>,
    pub stale_after_ms: u64,
    /// Incremented on every replace; dependents use it for optimistic
    /// concurrency checks.
    pub version: u64,
    #[serde(default)]
    pub source: Option<CacheSource>,
}

impl CacheEntry {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.fetched_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let stale_after = chrono::Duration::milliseconds(self.stale_after_ms.min(i64::MAX as u64) as i64);
        self.age(now) >= stale_after
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if self.is_stale(now) {
            Freshness::StaleButUsable
        } else {
            Freshness::Fresh
        }
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age(now).num_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    Fresh,
    /// Returned as-is while a background revalidation runs.
    StaleButUsable,
    Absent,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub freshness: Freshness,
    pub entry: Option<CacheEntry>,
}

impl Lookup {
    pub fn absent() -> Self {
        Self {
            freshness: Freshness::Absent,
            entry: None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.entry.as_ref().map(|e| &e.value)
    }

    pub fn version(&self) -> Option<u64> {
        self.entry.as_ref().map(|e| e.version)
    }
}

/// A read-through request: where to cache and how to fetch.
#[derive(Debug, Clone)]
pub struct Query {
    pub key: CacheKey,
    pub operation: Operation,
    pub account: Option<Did>,
    /// Overrides the per-domain policy.
    pub stale_after: Option<Duration>,
}

impl Query {
    pub fn new(key: CacheKey, operation: Operation) -> Self {
        Self {
            key,
            operation,
            account: None,
            stale_after: None,
        }
    }

    pub fn as_account(mut self, account: Did) -> Self {
        self.account = Some(account);
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEventKind {
    Updated { version: u64 },
    Invalidated,
    Evicted,
}

/// Delivered to subscribers after an entry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: CacheKey,
    pub kind: CacheEventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(stale_after_ms: u64, fetched_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: CacheKey::new("feed", &["home"]),
            value: serde_json::json!([1, 2, 3]),
            fetched_at,
            stale_after_ms,
            version: 1,
            source: None,
        }
    }

    #[test]
    fn test_key_building() {
        let key = CacheKey::new("feed", &["home"]);
        assert_eq!(key.as_str(), "feed:home");
        assert_eq!(key.domain(), "feed");
        assert_eq!(CacheKey::new("profile", &[]).domain(), "profile");
        assert_eq!(
            CacheKey::new("thread", &["at://did:plc:a/post/1"]).domain(),
            "thread"
        );
    }

    #[test]
    fn test_freshness_boundary() {
        let now = Utc::now();
        let e = entry(60_000, now);
        assert_eq!(e.freshness(now), Freshness::Fresh);
        assert_eq!(
            e.freshness(now + chrono::Duration::seconds(59)),
            Freshness::Fresh
        );
        assert_eq!(
            e.freshness(now + chrono::Duration::seconds(60)),
            Freshness::StaleButUsable
        );
    }

    #[test]
    fn test_age_display() {
        let now = Utc::now();
        let e = entry(60_000, now);
        assert_eq!(e.age_display(now), "just now");
        assert_eq!(e.age_display(now - chrono::Duration::minutes(5)), "just now");
        assert_eq!(e.age_display(now + chrono::Duration::minutes(5)), "5m ago");
        assert_eq!(e.age_display(now + chrono::Duration::minutes(95)), "2h ago");
        assert_eq!(e.age_display(now + chrono::Duration::hours(30)), "1d ago");
        assert_eq!(e.age_display(now + chrono::Duration::hours(40)), "2d ago");
    }
}
