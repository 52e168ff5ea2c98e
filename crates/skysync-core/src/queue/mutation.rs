use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Operation;
use crate::auth::Did;
use crate::cache::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    /// Gave up; waits for an explicit retry or discard.
    Failed,
    Confirmed,
}

impl MutationStatus {
    pub fn label(self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in-flight",
            MutationStatus::Failed => "failed",
            MutationStatus::Confirmed => "confirmed",
        }
    }
}

/// Cache entries made obsolete by a confirmed mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Invalidation {
    pub keys: Vec<CacheKey>,
    pub domains: Vec<String>,
}

impl Invalidation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: CacheKey) -> Self {
        self.keys.push(key);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.domains.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub seq: u64,
    pub account: Did,
    pub operation: Operation,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: MutationStatus,
    #[serde(default)]
    pub invalidates: Invalidation,
    pub last_error: Option<String>,
}

/// Durable form of one account's queue (`queue/<did>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AccountQueue {
    /// Sequence number handed to the next enqueue. Survives compaction so
    /// numbers are never reused.
    pub next_seq: u64,
    pub items: Vec<QueuedMutation>,
}

impl AccountQueue {
    pub fn item_mut(&mut self, seq: u64) -> Option<&mut QueuedMutation> {
        self.items.iter_mut().find(|m| m.seq == seq)
    }

    /// Lowest-numbered item still awaiting a verdict, pending or in flight.
    fn head(&self) -> Option<&QueuedMutation> {
        self.items
            .iter()
            .filter(|m| matches!(m.status, MutationStatus::Pending | MutationStatus::InFlight))
            .min_by_key(|m| m.seq)
    }

    /// The item to attempt next. `None` while an earlier item is in flight,
    /// so later items never overtake it.
    pub fn next_pending(&self) -> Option<&QueuedMutation> {
        self.head().filter(|m| m.status == MutationStatus::Pending)
    }

    /// Whether anything still needs replaying.
    pub fn has_unsettled(&self) -> bool {
        self.head().is_some()
    }

    /// Return crash-interrupted attempts to pending. Returns whether
    /// anything changed.
    pub fn recover_in_flight(&mut self) -> bool {
        let mut changed = false;
        for item in self
            .items
            .iter_mut()
            .filter(|m| m.status == MutationStatus::InFlight)
        {
            item.status = MutationStatus::Pending;
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Enqueued { account: Did, seq: u64 },
    StatusChanged {
        account: Did,
        seq: u64,
        status: MutationStatus,
    },
    Discarded { account: Did, seq: u64 },
    /// Replay for the account stopped until it is authenticated again.
    Paused { account: Did },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seq: u64, status: MutationStatus) -> QueuedMutation {
        QueuedMutation {
            seq,
            account: Did::new("did:plc:alice"),
            operation: Operation::procedure("app.bsky.feed.post", serde_json::json!({})),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
            status,
            invalidates: Invalidation::none(),
            last_error: None,
        }
    }

    #[test]
    fn test_next_pending_is_lowest_sequence() {
        let queue = AccountQueue {
            next_seq: 5,
            items: vec![
                item(4, MutationStatus::Pending),
                item(1, MutationStatus::Confirmed),
                item(2, MutationStatus::Failed),
                item(3, MutationStatus::Pending),
            ],
        };
        assert_eq!(queue.next_pending().map(|m| m.seq), Some(3));
    }

    #[test]
    fn test_in_flight_item_blocks_later_ones() {
        let queue = AccountQueue {
            next_seq: 4,
            items: vec![
                item(1, MutationStatus::Confirmed),
                item(2, MutationStatus::InFlight),
                item(3, MutationStatus::Pending),
            ],
        };
        assert_eq!(queue.next_pending(), None);
        assert!(queue.has_unsettled());

        let settled = AccountQueue {
            next_seq: 3,
            items: vec![
                item(1, MutationStatus::Confirmed),
                item(2, MutationStatus::Failed),
            ],
        };
        assert!(!settled.has_unsettled());
    }

    #[test]
    fn test_recover_in_flight() {
        let mut queue = AccountQueue {
            next_seq: 3,
            items: vec![
                item(1, MutationStatus::InFlight),
                item(2, MutationStatus::Pending),
            ],
        };
        assert!(queue.recover_in_flight());
        assert!(queue.items.iter().all(|m| m.status == MutationStatus::Pending));
        assert!(!queue.recover_in_flight());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&MutationStatus::InFlight).unwrap();
        assert_eq!(json, "\"in_flight\"");
        assert_eq!(MutationStatus::InFlight.label(), "in-flight");
    }
}
