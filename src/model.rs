use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// ── Records owned by other services ──────────────────────────────
//
// The reservation service only ever holds read-only copies of these,
// obtained through the resolver.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gym {
    pub id: Ulid,
    pub name: String,
    pub subscription_id: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Ulid,
    pub status: SubscriptionStatus,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// Credentials never leave the user service; the replica carries identity
/// and confirmation state only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub confirmed: bool,
}

// ── Reservation service aggregates ───────────────────────────────

/// Value object, equal by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionCategory(String);

impl SessionCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// Returns `None` unless `start < end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    /// Weak reference into the gym service.
    pub gym_id: Ulid,
    pub name: String,
    /// Authoritative back-reference used for cascading deletes.
    pub session_ids: BTreeSet<Ulid>,
}

impl Room {
    pub fn new(id: Ulid, gym_id: Ulid, name: String) -> Self {
        Self {
            id,
            gym_id,
            name,
            session_ids: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeRange,
    pub categories: Vec<SessionCategory>,
    pub max_participants: u32,
}

impl Session {
    pub fn has_category_named(&self, names: &BTreeSet<&str>) -> bool {
        self.categories.iter().any(|c| names.contains(c.name()))
    }

    /// Same room, same date, overlapping time of day.
    pub fn clashes_with(&self, other: &Session) -> bool {
        self.id != other.id
            && self.room_id == other.room_id
            && self.date == other.date
            && self.time.overlaps(&other.time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub session_id: Ulid,
    /// Weak reference into the user service.
    pub participant_id: Ulid,
}

// ── Journal events ───────────────────────────────────────────────

/// One durable mutation of the reservation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomAdded(Room),
    RoomUpdated(Room),
    RoomRemoved { id: Ulid },
    SessionAdded(Session),
    SessionUpdated(Session),
    SessionsRemoved { ids: Vec<Ulid> },
    ReservationAdded(Reservation),
}
