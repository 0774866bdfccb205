use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, Fault, SessionFilter};

impl Engine {
    /// Sessions among `ids` passing `filter`, in no particular order.
    /// An empty id set yields nothing, never "all sessions".
    pub async fn list_sessions(
        &self,
        ids: &[Ulid],
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, Fault> {
        if ids.len() > MAX_IDS_PER_QUERY {
            return Err(Fault::Validation(format!(
                "too many session ids: {} > {MAX_IDS_PER_QUERY}",
                ids.len()
            )));
        }
        self.fetch_sessions(ids, filter).await
    }

    /// Flattens the session sets of every room of the gym, then filters.
    pub async fn list_sessions_by_gym(
        &self,
        gym_id: Ulid,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, Fault> {
        let rooms = self.rooms.list_by_gym(gym_id).await?;
        let ids: Vec<Ulid> = rooms
            .iter()
            .flat_map(|room| room.session_ids.iter().copied())
            .collect();
        self.fetch_sessions(&ids, filter).await
    }

    /// Every session whose room id is `room_id`, unfiltered.
    pub async fn list_sessions_by_room(&self, room_id: Ulid) -> Result<Vec<Session>, Fault> {
        Ok(self.sessions.list_by_room(room_id).await?)
    }

    pub async fn get_session(&self, id: Ulid) -> Result<Session, Fault> {
        self.sessions
            .get_by_id(id)
            .await?
            .ok_or(Fault::NotFound { kind: "session", id })
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, Fault> {
        self.rooms
            .get_by_id(id)
            .await?
            .ok_or(Fault::NotFound { kind: "room", id })
    }

    pub async fn list_rooms(&self, gym_id: Ulid) -> Result<Vec<Room>, Fault> {
        Ok(self.rooms.list_by_gym(gym_id).await?)
    }

    pub async fn list_reservations(&self, session_id: Ulid) -> Result<Vec<Reservation>, Fault> {
        Ok(self.reservations.list_by_session(session_id).await?)
    }

    async fn fetch_sessions(
        &self,
        ids: &[Ulid],
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, Fault> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.sessions.list_by_ids(ids, filter).await?)
    }
}
