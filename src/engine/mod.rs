mod error;
mod filter;
mod mutations;
mod queries;
mod reservations;

pub use error::Fault;
pub use filter::SessionFilter;

use std::sync::Arc;

use crate::resolver::ReferenceResolver;
use crate::store::{MemoryStore, ReservationRepository, RoomRepository, SessionRepository};

/// The reservation service core: session lookup, room/session lifecycle and
/// the reservation workflow, over repository contracts and a resolver for
/// references owned by other services.
///
/// Holds no mutable state of its own; every operation is a sequence of
/// repository and resolver calls.
pub struct Engine {
    pub(crate) sessions: Arc<dyn SessionRepository>,
    pub(crate) rooms: Arc<dyn RoomRepository>,
    pub(crate) reservations: Arc<dyn ReservationRepository>,
    pub(crate) resolver: ReferenceResolver,
}

impl Engine {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        rooms: Arc<dyn RoomRepository>,
        reservations: Arc<dyn ReservationRepository>,
        resolver: ReferenceResolver,
    ) -> Self {
        Self {
            sessions,
            rooms,
            reservations,
            resolver,
        }
    }

    /// All three contracts served by one store.
    pub fn with_store(store: Arc<MemoryStore>, resolver: ReferenceResolver) -> Self {
        Self::new(store.clone(), store.clone(), store, resolver)
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }
}
