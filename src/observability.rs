use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotmatch_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotmatch_query_duration_seconds";

// ── Assignment path ─────────────────────────────────────────────

/// Counter: finished assignments. Labels: outcome (ok, not_found, conflict, ...).
pub const ASSIGNMENTS_TOTAL: &str = "slotmatch_assignments_total";

/// Counter: aborted assignment attempts. Labels: phase reached.
pub const ASSIGN_ABORTS_TOTAL: &str = "slotmatch_assign_aborts_total";

/// Counter: attempts retried after a transient store failure.
pub const ASSIGN_RETRIES_TOTAL: &str = "slotmatch_assign_retries_total";

/// Histogram: end-to-end assignment latency in seconds, retries included.
pub const ASSIGN_DURATION_SECONDS: &str = "slotmatch_assign_duration_seconds";

/// Histogram: time spent acquiring row locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotmatch_lock_wait_seconds";

/// Histogram: entries returned per calendar query.
pub const CALENDAR_ENTRIES: &str = "slotmatch_calendar_entries";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotmatch_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotmatch_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotmatch_connections_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// `RUST_LOG` filtering, `slotmatch=info` by default. JSON lines when `json` is set.
pub fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slotmatch=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectCalendar { .. } => "select_calendar",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertManagers { .. } => "insert_managers",
        Command::InsertSlots { .. } => "insert_slots",
        Command::SelectManagers => "select_managers",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
    }
}
