use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Cross-service resolution ────────────────────────────────────

/// Counter: reference resolutions. Labels: kind, outcome.
pub const RESOLUTIONS_TOTAL: &str = "gymsched_resolutions_total";

/// Histogram: resolution latency in seconds. Labels: kind.
pub const RESOLVE_DURATION_SECONDS: &str = "gymsched_resolve_duration_seconds";

/// Gauge: events the local replica is behind its owners.
pub const REPLICA_LAG_EVENTS: &str = "gymsched_replica_lag_events";

// ── Workflows ───────────────────────────────────────────────────

/// Counter: faults returned to callers. Labels: kind.
pub const FAULTS_TOTAL: &str = "gymsched_faults_total";

/// Counter: reservations persisted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "gymsched_reservations_created_total";

/// Counter: sessions removed by room cascades.
pub const CASCADE_SESSIONS_REMOVED_TOTAL: &str = "gymsched_cascade_sessions_removed_total";

/// Counter: repairs made by the reconciliation sweep. Labels: repair.
pub const SWEEP_REPAIRS_TOTAL: &str = "gymsched_sweep_repairs_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: journal append + fsync duration in seconds.
pub const WAL_APPEND_DURATION_SECONDS: &str = "gymsched_wal_append_duration_seconds";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
