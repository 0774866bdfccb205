use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::engine::SessionFilter;
use crate::model::*;
use crate::wal::Wal;

use super::{ReservationRepository, RoomRepository, SessionRepository, StoreError};

/// In-memory reservation-service state, optionally journaled to a WAL.
///
/// Reads go straight to the maps. Writes are serialized through `writer`:
/// validate, append to the journal, then apply. An event is only applied
/// once it is durable, so a replay reproduces exactly what callers observed.
pub struct MemoryStore {
    rooms: DashMap<Ulid, Room>,
    sessions: DashMap<Ulid, Session>,
    reservations: DashMap<Ulid, Reservation>,
    /// session id → reservation ids
    by_session: DashMap<Ulid, Vec<Ulid>>,
    writer: Mutex<Option<Wal>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MemoryStore {
    /// A store with no journal. State is lost on drop.
    pub fn in_memory() -> Self {
        Self {
            rooms: DashMap::new(),
            sessions: DashMap::new(),
            reservations: DashMap::new(),
            by_session: DashMap::new(),
            writer: Mutex::new(None),
        }
    }

    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let mut store = Self::in_memory();
        for event in &events {
            store.apply(event);
        }
        *store.writer.get_mut() = Some(wal);
        tracing::info!(
            "replayed {} journal events: {} rooms, {} sessions, {} reservations",
            events.len(),
            store.rooms.len(),
            store.sessions.len(),
            store.reservations.len()
        );
        Ok(store)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.writer
            .lock()
            .await
            .as_ref()
            .map_or(0, Wal::appends_since_compact)
    }

    /// Rewrite the journal as the minimal event set for the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        let Some(wal) = writer.as_mut() else {
            return Ok(());
        };
        let mut events: Vec<Event> = self
            .rooms
            .iter()
            .map(|e| Event::RoomAdded(e.value().clone()))
            .collect();
        events.extend(self.sessions.iter().map(|e| Event::SessionAdded(e.value().clone())));
        events.extend(
            self.reservations
                .iter()
                .map(|e| Event::ReservationAdded(e.value().clone())),
        );
        wal.compact(&events)
            .map_err(|e| StoreError::Journal(e.to_string()))?;
        tracing::info!("compacted journal to {} events", events.len());
        Ok(())
    }

    fn persist(writer: &mut Option<Wal>, event: &Event) -> Result<(), StoreError> {
        let Some(wal) = writer.as_mut() else {
            return Ok(());
        };
        let started = Instant::now();
        let result = wal
            .append(event)
            .map_err(|e| StoreError::Journal(e.to_string()));
        metrics::histogram!(crate::observability::WAL_APPEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Apply an already-durable event. Never fails: replay must be total.
    fn apply(&self, event: &Event) {
        match event {
            Event::RoomAdded(room) | Event::RoomUpdated(room) => {
                self.rooms.insert(room.id, room.clone());
            }
            Event::RoomRemoved { id } => {
                self.rooms.remove(id);
            }
            Event::SessionAdded(session) | Event::SessionUpdated(session) => {
                self.sessions.insert(session.id, session.clone());
            }
            Event::SessionsRemoved { ids } => {
                for id in ids {
                    self.sessions.remove(id);
                    if let Some((_, reservation_ids)) = self.by_session.remove(id) {
                        for rid in reservation_ids {
                            self.reservations.remove(&rid);
                        }
                    }
                }
            }
            Event::ReservationAdded(reservation) => {
                self.reservations.insert(reservation.id, reservation.clone());
                self.by_session
                    .entry(reservation.session_id)
                    .or_default()
                    .push(reservation.id);
            }
        }
    }

    async fn commit(&self, event: Event) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    fn sessions_matching(&self, ids: &[Ulid], filter: &SessionFilter) -> Vec<Session> {
        let wanted: HashSet<&Ulid> = ids.iter().collect();
        wanted
            .into_iter()
            .filter_map(|id| self.sessions.get(id).map(|e| e.value().clone()))
            .filter(|s| filter.matches(s))
            .collect()
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn add(&self, session: &Session) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if self.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        let event = Event::SessionAdded(session.clone());
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&id).map(|e| e.value().clone()))
    }

    async fn list_by_ids(
        &self,
        ids: &[Ulid],
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions_matching(ids, filter))
    }

    async fn list_by_gym(
        &self,
        gym_id: Ulid,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, StoreError> {
        let ids: Vec<Ulid> = self
            .rooms
            .iter()
            .filter(|e| e.value().gym_id == gym_id)
            .flat_map(|e| e.value().session_ids.iter().copied().collect::<Vec<_>>())
            .collect();
        Ok(self.sessions_matching(&ids, filter))
    }

    async fn list_by_room(&self, room_id: Ulid) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|e| e.value().room_id == room_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.iter().map(|e| e.value().clone()).collect())
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if !self.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} no longer exists",
                session.id
            )));
        }
        let event = Event::SessionUpdated(session.clone());
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    async fn remove_range(&self, sessions: &[Session]) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        let ids: Vec<Ulid> = sessions
            .iter()
            .map(|s| s.id)
            .filter(|id| self.sessions.contains_key(id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let event = Event::SessionsRemoved { ids };
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for MemoryStore {
    async fn add(&self, room: &Room) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if self.rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict(format!("room {} already exists", room.id)));
        }
        let event = Event::RoomAdded(room.clone());
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(&id).map(|e| e.value().clone()))
    }

    async fn list_by_gym(&self, gym_id: Ulid) -> Result<Vec<Room>, StoreError> {
        Ok(self
            .rooms
            .iter()
            .filter(|e| e.value().gym_id == gym_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.rooms.iter().map(|e| e.value().clone()).collect())
    }

    async fn update(&self, room: &Room) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if !self.rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict(format!("room {} no longer exists", room.id)));
        }
        let event = Event::RoomUpdated(room.clone());
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    async fn remove(&self, room: &Room) -> Result<(), StoreError> {
        if !self.rooms.contains_key(&room.id) {
            return Ok(());
        }
        self.commit(Event::RoomRemoved { id: room.id }).await
    }

    async fn attach_session(&self, room_id: Ulid, session_id: Ulid) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        let mut room = self
            .rooms
            .get(&room_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::Conflict(format!("room {room_id} no longer exists")))?;
        if !room.session_ids.insert(session_id) {
            return Ok(());
        }
        let event = Event::RoomUpdated(room);
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    async fn detach_session(&self, room_id: Ulid, session_id: Ulid) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        let Some(mut room) = self.rooms.get(&room_id).map(|e| e.value().clone()) else {
            return Ok(());
        };
        if !room.session_ids.remove(&session_id) {
            return Ok(());
        }
        let event = Event::RoomUpdated(room);
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }
}

#[async_trait]
impl ReservationRepository for MemoryStore {
    async fn add(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        let session_id = reservation.session_id;
        let max = self
            .sessions
            .get(&session_id)
            .map(|e| e.value().max_participants)
            .ok_or_else(|| StoreError::Conflict(format!("session {session_id} no longer exists")))?;
        if self.reservations.contains_key(&reservation.id) {
            return Err(StoreError::Conflict(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        let existing = self.list_by_session(session_id).await?;
        if existing
            .iter()
            .any(|r| r.participant_id == reservation.participant_id)
        {
            return Err(StoreError::Conflict(format!(
                "participant {} already holds a reservation for session {session_id}",
                reservation.participant_id
            )));
        }
        if existing.len() >= max as usize {
            return Err(StoreError::Conflict(format!("session {session_id} is full")));
        }
        let event = Event::ReservationAdded(reservation.clone());
        Self::persist(&mut writer, &event)?;
        self.apply(&event);
        Ok(())
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.get(&id).map(|e| e.value().clone()))
    }

    async fn list_by_session(&self, session_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        let ids = self
            .by_session
            .get(&session_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|e| e.value().clone()))
            .collect())
    }

    async fn count_by_session(&self, session_id: Ulid) -> Result<usize, StoreError> {
        Ok(self.by_session.get(&session_id).map_or(0, |e| e.value().len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gymsched_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn session(room_id: Ulid, max_participants: u32) -> Session {
        Session {
            id: Ulid::new(),
            room_id,
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            time: TimeRange::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            )
            .unwrap(),
            categories: vec![SessionCategory::new("yoga")],
            max_participants,
        }
    }

    fn reservation(session_id: Ulid, participant_id: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            session_id,
            participant_id,
        }
    }

    #[tokio::test]
    async fn duplicate_participant_rejected() {
        let store = MemoryStore::in_memory();
        let s = session(Ulid::new(), 5);
        SessionRepository::add(&store, &s).await.unwrap();
        let user = Ulid::new();

        ReservationRepository::add(&store, &reservation(s.id, user)).await.unwrap();
        let second = ReservationRepository::add(&store, &reservation(s.id, user)).await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
        assert_eq!(store.count_by_session(s.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn capacity_enforced_on_insert() {
        let store = MemoryStore::in_memory();
        let s = session(Ulid::new(), 2);
        SessionRepository::add(&store, &s).await.unwrap();

        for _ in 0..2 {
            ReservationRepository::add(&store, &reservation(s.id, Ulid::new()))
                .await
                .unwrap();
        }
        let third = ReservationRepository::add(&store, &reservation(s.id, Ulid::new())).await;
        assert_eq!(
            third,
            Err(StoreError::Conflict(format!("session {} is full", s.id)))
        );
    }

    #[tokio::test]
    async fn concurrent_inserts_never_exceed_capacity() {
        let store = std::sync::Arc::new(MemoryStore::in_memory());
        let s = session(Ulid::new(), 3);
        SessionRepository::add(store.as_ref(), &s).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let r = reservation(s.id, Ulid::new());
            handles.push(tokio::spawn(async move {
                ReservationRepository::add(store.as_ref(), &r).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(store.count_by_session(s.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn removing_sessions_drops_their_reservations() {
        let store = MemoryStore::in_memory();
        let s = session(Ulid::new(), 5);
        SessionRepository::add(&store, &s).await.unwrap();
        let r = reservation(s.id, Ulid::new());
        ReservationRepository::add(&store, &r).await.unwrap();

        store.remove_range(std::slice::from_ref(&s)).await.unwrap();
        assert!(SessionRepository::get_by_id(&store, s.id).await.unwrap().is_none());
        assert!(ReservationRepository::get_by_id(&store, r.id).await.unwrap().is_none());
        assert_eq!(store.count_by_session(s.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn journal_replay_restores_state() {
        let path = tmp_path("replay.wal");
        let gym_id = Ulid::new();
        let mut room = Room::new(Ulid::new(), gym_id, "Studio".into());
        let kept = session(room.id, 4);
        let dropped = session(room.id, 4);
        let r = reservation(kept.id, Ulid::new());
        {
            let store = MemoryStore::open(&path).unwrap();
            RoomRepository::add(&store, &room).await.unwrap();
            SessionRepository::add(&store, &kept).await.unwrap();
            SessionRepository::add(&store, &dropped).await.unwrap();
            room.session_ids.insert(kept.id);
            RoomRepository::update(&store, &room).await.unwrap();
            ReservationRepository::add(&store, &r).await.unwrap();
            store.remove_range(std::slice::from_ref(&dropped)).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 6);
        }

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(RoomRepository::get_by_id(&store, room.id).await.unwrap(), Some(room.clone()));
        assert_eq!(store.list_by_room(room.id).await.unwrap(), vec![kept.clone()]);
        assert_eq!(store.list_by_session(kept.id).await.unwrap(), vec![r]);

        store.compact().await.unwrap();
        drop(store);
        let store = MemoryStore::open(&path).unwrap();
        let listed = SessionRepository::list_by_gym(&store, gym_id, &SessionFilter::default())
            .await
            .unwrap();
        assert_eq!(listed, vec![kept]);
    }

    #[tokio::test]
    async fn update_of_missing_room_is_a_conflict() {
        let store = MemoryStore::in_memory();
        let room = Room::new(Ulid::new(), Ulid::new(), "Ghost".into());
        let result = RoomRepository::update(&store, &room).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        RoomRepository::remove(&store, &room).await.unwrap();
    }

    #[tokio::test]
    async fn attach_and_detach_never_lose_concurrent_ids() {
        let store = Arc::new(MemoryStore::in_memory());
        let room = Room::new(Ulid::new(), Ulid::new(), "Studio".into());
        RoomRepository::add(store.as_ref(), &room).await.unwrap();

        let room_id = room.id;
        let ids: Vec<Ulid> = (0..32).map(|_| Ulid::new()).collect();
        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let store = store.clone();
                tokio::spawn(async move { store.attach_session(room_id, id).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let listed = RoomRepository::get_by_id(store.as_ref(), room.id).await.unwrap().unwrap();
        assert_eq!(listed.session_ids, ids.iter().copied().collect());

        store.detach_session(room.id, ids[0]).await.unwrap();
        store.detach_session(room.id, ids[0]).await.unwrap();
        store.attach_session(room.id, ids[1]).await.unwrap();
        let listed = RoomRepository::get_by_id(store.as_ref(), room.id).await.unwrap().unwrap();
        assert_eq!(listed.session_ids.len(), 31);

        let missing = store.attach_session(Ulid::new(), Ulid::new()).await;
        assert!(matches!(missing, Err(StoreError::Conflict(_))));
        store.detach_session(Ulid::new(), Ulid::new()).await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_a_torn_tail_survive_restart() {
        let path = tmp_path("torn_then_write.wal");
        let first = Room::new(Ulid::new(), Ulid::new(), "First".into());
        let second = Room::new(Ulid::new(), Ulid::new(), "Second".into());
        {
            let store = MemoryStore::open(&path).unwrap();
            RoomRepository::add(&store, &first).await.unwrap();
        }
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[5u8, 0, 0]).unwrap();
        }
        {
            let store = MemoryStore::open(&path).unwrap();
            RoomRepository::add(&store, &second).await.unwrap();
        }
        let store = MemoryStore::open(&path).unwrap();
        let rooms = RoomRepository::list(&store).await.unwrap();
        assert_eq!(rooms.len(), 2);
        assert!(rooms.contains(&second));
    }
}
