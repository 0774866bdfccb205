//! Persistence-facing contracts consumed by the engine.
//!
//! Each trait is the narrow surface a storage collaborator must provide.
//! [`MemoryStore`] implements all three over one journaled in-memory state.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::SessionFilter;
use crate::model::{Reservation, Room, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Rejected by a uniqueness, capacity or existence constraint at write time.
    Conflict(String),
    /// The journal could not be written.
    Journal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(msg) => write!(f, "write conflict: {msg}"),
            StoreError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn add(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Session>, StoreError>;

    /// Sessions whose id is in `ids` and which pass `filter`. No ordering guarantee.
    async fn list_by_ids(
        &self,
        ids: &[Ulid],
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, StoreError>;

    /// Sessions listed by any room of the gym, then filtered.
    async fn list_by_gym(
        &self,
        gym_id: Ulid,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, StoreError>;

    /// Sessions whose `room_id` is `room_id`, unfiltered.
    async fn list_by_room(&self, room_id: Ulid) -> Result<Vec<Session>, StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    async fn update(&self, session: &Session) -> Result<(), StoreError>;

    async fn remove_range(&self, sessions: &[Session]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn add(&self, room: &Room) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Room>, StoreError>;

    async fn list_by_gym(&self, gym_id: Ulid) -> Result<Vec<Room>, StoreError>;

    async fn list(&self) -> Result<Vec<Room>, StoreError>;

    async fn update(&self, room: &Room) -> Result<(), StoreError>;

    async fn remove(&self, room: &Room) -> Result<(), StoreError>;

    /// Add one id to the room's session set, atomically against other writers
    /// of the same room. Idempotent; a missing room is a conflict.
    async fn attach_session(&self, room_id: Ulid, session_id: Ulid) -> Result<(), StoreError>;

    /// Remove one id from the room's session set. Idempotent; a missing room
    /// is not an error.
    async fn detach_session(&self, room_id: Ulid, session_id: Ulid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Must reject, atomically with the insert, a second reservation by the
    /// same participant for the same session and any insert beyond the
    /// session's `max_participants`.
    async fn add(&self, reservation: &Reservation) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    async fn list_by_session(&self, session_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    async fn count_by_session(&self, session_id: Ulid) -> Result<usize, StoreError>;
}
