use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, Fault};
use crate::model::*;
use crate::resolver::Resolution;
use crate::store::MemoryStore;

/// What one reconciliation pass repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose room no longer exists.
    pub orphans_removed: usize,
    /// Session ids a room listed that do not exist (or belong elsewhere).
    pub dangling_dropped: usize,
    /// Sessions added back to their room's session set.
    pub reattached: usize,
    /// Rooms removed because their gym is confirmed gone.
    pub rooms_removed: usize,
    /// Rooms whose gym could not be confirmed either way this pass.
    pub deferred: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_removed == 0
            && self.dangling_dropped == 0
            && self.reattached == 0
            && self.rooms_removed == 0
    }
}

fn count_repair(repair: &'static str, n: usize) {
    if n > 0 {
        metrics::counter!(crate::observability::SWEEP_REPAIRS_TOTAL, "repair" => repair)
            .increment(n as u64);
    }
}

/// A room may list a session id briefly before the session itself is
/// written; younger dangling ids are left alone.
pub const DANGLING_GRACE: Duration = Duration::from_secs(60);

/// Detect and repair what interrupted multi-step writes leave behind, then
/// retire rooms of gyms the gym service has confirmed deleted.
pub async fn run_once(engine: &Engine) -> Result<SweepReport, Fault> {
    run_once_at(engine, SystemTime::now()).await
}

/// [`run_once`] with an explicit clock for the dangling-id grace period.
///
/// Every repair is re-checked against fresh state right before it is made,
/// so writes racing the pass are never undone.
pub async fn run_once_at(engine: &Engine, now: SystemTime) -> Result<SweepReport, Fault> {
    let mut report = SweepReport::default();
    // Sessions before rooms: a room created in between only adds candidates
    // that the re-checks below discard.
    let sessions = engine.sessions.list().await?;
    let rooms = engine.rooms.list().await?;
    let room_ids: HashSet<Ulid> = rooms.iter().map(|r| r.id).collect();

    let (live, candidates): (Vec<Session>, Vec<Session>) = sessions
        .into_iter()
        .partition(|s| room_ids.contains(&s.room_id));
    let mut orphans = Vec::new();
    for s in candidates {
        if engine.rooms.get_by_id(s.room_id).await?.is_none() {
            orphans.push(s);
        }
    }
    if !orphans.is_empty() {
        engine.sessions.remove_range(&orphans).await?;
        report.orphans_removed = orphans.len();
    }

    let mut by_room: HashMap<Ulid, BTreeSet<Ulid>> = HashMap::new();
    for s in &live {
        by_room.entry(s.room_id).or_default().insert(s.id);
    }
    let cutoff = now
        .checked_sub(DANGLING_GRACE)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    for room in &rooms {
        let snapshot = by_room.remove(&room.id).unwrap_or_default();
        let Some(current) = engine.rooms.get_by_id(room.id).await? else {
            continue;
        };
        for &id in current.session_ids.difference(&snapshot) {
            if id.datetime() > cutoff {
                continue;
            }
            let belongs = engine
                .sessions
                .get_by_id(id)
                .await?
                .is_some_and(|s| s.room_id == room.id);
            if !belongs {
                engine.rooms.detach_session(room.id, id).await?;
                report.dangling_dropped += 1;
            }
        }
        for &id in snapshot.difference(&current.session_ids) {
            if engine.sessions.get_by_id(id).await?.is_some() {
                engine.rooms.attach_session(room.id, id).await?;
                report.reattached += 1;
            }
        }
    }

    let mut gyms: HashMap<Ulid, Resolution<Gym>> = HashMap::new();
    for room in &rooms {
        if !gyms.contains_key(&room.gym_id) {
            let resolution = engine.resolver.resolve_gym(room.gym_id).await?;
            gyms.insert(room.gym_id, resolution);
        }
        match gyms.get(&room.gym_id) {
            Some(Resolution::Absent) => {
                if let Some(current) = engine.rooms.get_by_id(room.id).await? {
                    engine.remove_room(&current).await?;
                    report.rooms_removed += 1;
                }
            }
            Some(Resolution::Indeterminate(why)) => {
                debug!("room {}: gym {} unconfirmed ({why})", room.id, room.gym_id);
                report.deferred += 1;
            }
            _ => {}
        }
    }

    count_repair("orphan_session", report.orphans_removed);
    count_repair("dangling_session_id", report.dangling_dropped);
    count_repair("reattached_session", report.reattached);
    count_repair("room_of_missing_gym", report.rooms_removed);
    Ok(report)
}

/// Background task: periodic reconciliation plus journal compaction.
pub async fn run_sweeper(
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    period: Duration,
    compact_threshold: u64,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match run_once(&engine).await {
            Ok(report) if !report.is_clean() => info!("sweep repaired: {report:?}"),
            Ok(report) if report.deferred > 0 => {
                debug!("sweep deferred {} rooms", report.deferred);
            }
            Ok(_) => {}
            Err(e) => warn!("sweep aborted: {e}"),
        }
        if store.appends_since_compact().await >= compact_threshold
            && let Err(e) = store.compact().await
        {
            warn!("compaction failed: {e}");
        }
    }
}
