use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::reconcile::{FaultDetail, Reconciliation};
use crate::resolver::WeakRef;

use super::{Engine, Fault};

fn validate_room_name(name: &str) -> Result<(), Fault> {
    if name.trim().is_empty() {
        return Err(Fault::Validation("room name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Fault::Validation("room name too long".into()));
    }
    Ok(())
}

fn validate_session_shape(categories: &[SessionCategory], max_participants: u32) -> Result<(), Fault> {
    if categories.len() > MAX_CATEGORIES_PER_SESSION {
        return Err(Fault::Validation("too many categories".into()));
    }
    if let Some(bad) = categories
        .iter()
        .find(|c| c.name().is_empty() || c.name().len() > MAX_CATEGORY_NAME_LEN)
    {
        return Err(Fault::Validation(format!("invalid category name {:?}", bad.name())));
    }
    if max_participants == 0 || max_participants > MAX_PARTICIPANTS {
        return Err(Fault::Validation(format!(
            "max participants must be within 1..={MAX_PARTICIPANTS}"
        )));
    }
    Ok(())
}

impl Engine {
    /// Add a room to a gym. The gym and its subscription live in the gym
    /// service; both must resolve, and the subscription must be active.
    pub async fn create_room(&self, gym_id: Ulid, name: String) -> Result<Room, Fault> {
        self.try_create_room(gym_id, name).await.map_err(Fault::observed)
    }

    async fn try_create_room(&self, gym_id: Ulid, name: String) -> Result<Room, Fault> {
        validate_room_name(&name)?;

        let mut rec = Reconciliation::new();
        let resolved_gym = self.resolver.resolve_gym(gym_id).await?;
        if let Some(gym) = rec.check(WeakRef::gym(gym_id), resolved_gym) {
            // The subscription id is only known once the gym resolves.
            let sub_id = gym.subscription_id;
            let resolved_sub = self.resolver.resolve_subscription(sub_id).await?;
            let subscription = rec.check(WeakRef::subscription(sub_id), resolved_sub);
            if subscription.is_some_and(|s| !s.is_active()) {
                return Err(Fault::Validation(format!(
                    "subscription {sub_id} of gym {gym_id} is not active"
                )));
            }
        }
        rec.finish(FaultDetail::new(
            "room.gym_unresolved",
            format!("gym {gym_id} could not be confirmed for a new room"),
        ))?;

        let room = Room::new(Ulid::new(), gym_id, name);
        self.rooms.add(&room).await?;
        info!("created room {} in gym {gym_id}", room.id);
        Ok(room)
    }

    /// Remove a room of the given gym along with every session in it.
    pub async fn delete_room(&self, gym_id: Ulid, room_id: Ulid) -> Result<usize, Fault> {
        let room = self
            .rooms
            .get_by_id(room_id)
            .await?
            .filter(|room| room.gym_id == gym_id)
            .ok_or(Fault::NotFound { kind: "room", id: room_id })?;
        self.remove_room(&room).await.map_err(Fault::observed)
    }

    /// Cascading removal: sessions first, then the room.
    ///
    /// If the room removal fails after its sessions are gone, no session is
    /// left without a room; the room lingers with dangling session ids until
    /// the caller retries or the sweep drops them.
    pub async fn remove_room(&self, room: &Room) -> Result<usize, Fault> {
        let sessions = self.sessions.list_by_room(room.id).await?;
        self.sessions.remove_range(&sessions).await?;
        metrics::counter!(crate::observability::CASCADE_SESSIONS_REMOVED_TOTAL)
            .increment(sessions.len() as u64);

        if let Err(e) = self.rooms.remove(room).await {
            warn!(
                "room {} kept after removing its {} sessions: {e}",
                room.id,
                sessions.len()
            );
            return Err(Fault::Infrastructure(format!(
                "room {} partially removed (sessions gone, room kept): {e}",
                room.id
            )));
        }
        info!("removed room {} and {} sessions", room.id, sessions.len());
        Ok(sessions.len())
    }

    /// Put a new session in a room. It must not overlap another session of
    /// the same room on the same date.
    pub async fn schedule_session(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        time: TimeRange,
        categories: Vec<SessionCategory>,
        max_participants: u32,
    ) -> Result<Session, Fault> {
        self.try_schedule_session(room_id, date, time, categories, max_participants)
            .await
            .map_err(Fault::observed)
    }

    async fn try_schedule_session(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        time: TimeRange,
        categories: Vec<SessionCategory>,
        max_participants: u32,
    ) -> Result<Session, Fault> {
        validate_session_shape(&categories, max_participants)?;
        let room = self.get_room(room_id).await?;
        if room.session_ids.len() >= MAX_SESSIONS_PER_ROOM {
            return Err(Fault::Validation("too many sessions in room".into()));
        }

        let session = Session {
            id: Ulid::new(),
            room_id,
            date,
            time,
            categories,
            max_participants,
        };
        self.check_no_clash(&session).await?;

        // Back-reference first: a dangling id is ignored by listings, while a
        // session its room does not list is invisible to gym-wide queries.
        self.rooms.attach_session(room_id, session.id).await?;
        if let Err(e) = self.sessions.add(&session).await {
            if let Err(rollback) = self.rooms.detach_session(room_id, session.id).await {
                warn!("room {room_id} keeps dangling session id {}: {rollback}", session.id);
            }
            return Err(e.into());
        }
        info!("scheduled session {} in room {room_id} on {date}", session.id);
        Ok(session)
    }

    pub async fn reschedule_session(
        &self,
        session_id: Ulid,
        date: NaiveDate,
        time: TimeRange,
    ) -> Result<Session, Fault> {
        self.try_reschedule_session(session_id, date, time)
            .await
            .map_err(Fault::observed)
    }

    async fn try_reschedule_session(
        &self,
        session_id: Ulid,
        date: NaiveDate,
        time: TimeRange,
    ) -> Result<Session, Fault> {
        let mut session = self.get_session(session_id).await?;
        session.date = date;
        session.time = time;
        self.check_no_clash(&session).await?;
        self.sessions.update(&session).await?;
        info!("rescheduled session {session_id} to {date}");
        Ok(session)
    }

    async fn check_no_clash(&self, session: &Session) -> Result<(), Fault> {
        let siblings = self.sessions.list_by_room(session.room_id).await?;
        match siblings.iter().find(|other| session.clashes_with(other)) {
            Some(other) => Err(Fault::Validation(format!(
                "overlaps session {} ({}-{} on {})",
                other.id, other.time.start, other.time.end, other.date
            ))),
            None => Ok(()),
        }
    }
}
