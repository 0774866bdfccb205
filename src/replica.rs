use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Gym, Subscription, User};
use crate::resolver::{ChannelError, OwnerChannel, Record, Resolution, Uncertainty, WeakRef};

/// A change published by the gym or user service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    GymUpserted(Gym),
    GymDeleted { id: Ulid },
    SubscriptionUpserted(Subscription),
    SubscriptionDeleted { id: Ulid },
    UserUpserted(User),
    UserDeleted { id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEvent {
    /// Position in the owner's feed, starting at 1.
    pub seq: u64,
    pub change: Change,
}

/// One line of the replication feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMessage {
    Event(ReplicaEvent),
    /// Owner heartbeat carrying its latest published sequence.
    Head { seq: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Duplicate,
    /// Dropped; the owner must redeliver from `expected`.
    Gap { expected: u64 },
}

/// Read-only local copy of records owned by other services.
///
/// Events are applied strictly in sequence. `head` is the highest sequence the
/// owner is known to have published; while `applied < head`, a miss cannot be
/// told apart from an insert still in flight and is reported as indeterminate.
pub struct Replica {
    records: DashMap<WeakRef, Record>,
    applied: AtomicU64,
    head: AtomicU64,
    apply_lock: Mutex<()>,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            applied: AtomicU64::new(0),
            head: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn lag(&self) -> u64 {
        self.head().saturating_sub(self.applied())
    }

    pub fn observe_head(&self, seq: u64) {
        self.head.fetch_max(seq, Ordering::AcqRel);
        self.record_lag();
    }

    pub fn handle(&self, message: FeedMessage) -> Option<Applied> {
        match message {
            FeedMessage::Event(event) => Some(self.apply(event)),
            FeedMessage::Head { seq } => {
                self.observe_head(seq);
                None
            }
        }
    }

    pub fn apply(&self, event: ReplicaEvent) -> Applied {
        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let expected = self.applied() + 1;
        if event.seq < expected {
            return Applied::Duplicate;
        }
        self.head.fetch_max(event.seq, Ordering::AcqRel);
        if event.seq > expected {
            tracing::warn!("replica gap: got seq {}, expected {expected}", event.seq);
            self.record_lag();
            return Applied::Gap { expected };
        }

        match event.change {
            Change::GymUpserted(gym) => {
                self.records.insert(WeakRef::gym(gym.id), Record::Gym(gym));
            }
            Change::SubscriptionUpserted(sub) => {
                self.records
                    .insert(WeakRef::subscription(sub.id), Record::Subscription(sub));
            }
            Change::UserUpserted(user) => {
                self.records.insert(WeakRef::user(user.id), Record::User(user));
            }
            Change::GymDeleted { id } => {
                self.records.remove(&WeakRef::gym(id));
            }
            Change::SubscriptionDeleted { id } => {
                self.records.remove(&WeakRef::subscription(id));
            }
            Change::UserDeleted { id } => {
                self.records.remove(&WeakRef::user(id));
            }
        }
        self.applied.store(event.seq, Ordering::Release);
        self.record_lag();
        Applied::Applied
    }

    #[cfg(test)]
    fn count(&self, kind: crate::resolver::ReferenceKind) -> usize {
        self.records.iter().filter(|e| e.key().kind == kind).count()
    }

    fn record_lag(&self) {
        metrics::gauge!(crate::observability::REPLICA_LAG_EVENTS).set(self.lag() as f64);
    }
}

#[async_trait]
impl OwnerChannel for Replica {
    async fn fetch(&self, target: WeakRef) -> Result<Resolution<Record>, ChannelError> {
        if let Some(record) = self.records.get(&target) {
            return Ok(Resolution::Present(record.value().clone()));
        }
        let applied = self.applied();
        let head = self.head();
        if applied < head {
            Ok(Resolution::Indeterminate(Uncertainty::ReplicaBehind { applied, head }))
        } else {
            Ok(Resolution::Absent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ReferenceKind;

    fn user_event(seq: u64, id: Ulid) -> ReplicaEvent {
        ReplicaEvent {
            seq,
            change: Change::UserUpserted(User {
                id,
                email: format!("{id}@example.com"),
                confirmed: true,
            }),
        }
    }

    #[tokio::test]
    async fn caught_up_miss_is_absent() {
        let replica = Replica::new();
        let id = Ulid::new();
        assert_eq!(replica.apply(user_event(1, id)), Applied::Applied);

        let miss = replica.fetch(WeakRef::user(Ulid::new())).await.unwrap();
        assert_eq!(miss, Resolution::Absent);
        let hit = replica.fetch(WeakRef::user(id)).await.unwrap();
        assert!(hit.is_present());
    }

    #[tokio::test]
    async fn miss_while_behind_is_indeterminate() {
        let replica = Replica::new();
        replica.apply(user_event(1, Ulid::new()));
        replica.observe_head(3);

        let miss = replica.fetch(WeakRef::user(Ulid::new())).await.unwrap();
        assert_eq!(
            miss,
            Resolution::Indeterminate(Uncertainty::ReplicaBehind { applied: 1, head: 3 })
        );
        assert_eq!(replica.lag(), 2);
    }

    #[tokio::test]
    async fn gap_is_dropped_and_marks_lag() {
        let replica = Replica::new();
        let late = Ulid::new();
        assert_eq!(replica.apply(user_event(2, late)), Applied::Gap { expected: 1 });
        assert_eq!(replica.applied(), 0);
        assert_eq!(replica.head(), 2);
        assert!(matches!(
            replica.fetch(WeakRef::user(late)).await.unwrap(),
            Resolution::Indeterminate(_)
        ));

        assert_eq!(replica.apply(user_event(1, Ulid::new())), Applied::Applied);
        assert_eq!(replica.apply(user_event(2, late)), Applied::Applied);
        assert_eq!(replica.lag(), 0);
        assert!(replica.fetch(WeakRef::user(late)).await.unwrap().is_present());
    }

    #[tokio::test]
    async fn duplicates_and_deletes() {
        let replica = Replica::new();
        let id = Ulid::new();
        replica.apply(user_event(1, id));
        assert_eq!(replica.apply(user_event(1, id)), Applied::Duplicate);
        replica.apply(ReplicaEvent { seq: 2, change: Change::UserDeleted { id } });
        assert_eq!(replica.fetch(WeakRef::user(id)).await.unwrap(), Resolution::Absent);
        assert_eq!(replica.count(ReferenceKind::User), 0);
    }

    #[test]
    fn feed_lines_parse_as_json() {
        let gym_id = Ulid::new();
        let line = serde_json::to_string(&FeedMessage::Event(ReplicaEvent {
            seq: 1,
            change: Change::GymDeleted { id: gym_id },
        }))
        .unwrap();
        let replica = Replica::new();
        let message: FeedMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(replica.handle(message), Some(Applied::Applied));
        assert_eq!(replica.handle(FeedMessage::Head { seq: 4 }), None);
        assert_eq!(replica.lag(), 3);
    }
}
