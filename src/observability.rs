use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "holdfast_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "holdfast_query_duration_seconds";

/// Counter: fulfillment attempts. Labels: outcome.
pub const FULFILLMENTS_TOTAL: &str = "holdfast_fulfillments_total";

/// Counter: payment webhooks received. Labels: result.
pub const WEBHOOKS_TOTAL: &str = "holdfast_webhooks_total";

// ── Domain counters ─────────────────────────────────────────────

/// Counter: holds granted.
pub const HOLDS_ACQUIRED_TOTAL: &str = "holdfast_holds_acquired_total";

/// Counter: hold attempts skipped because the slot was locked.
pub const HOLDS_CONTENDED_TOTAL: &str = "holdfast_holds_contended_total";

/// Counter: slots flipped to booked.
pub const SLOTS_BOOKED_TOTAL: &str = "holdfast_slots_booked_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "holdfast_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "holdfast_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "holdfast_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "holdfast_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "holdfast_wal_flush_batch_size";

/// Counter: WAL rewrites.
pub const COMPACTIONS_TOTAL: &str = "holdfast_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertIntervals { .. } => "insert_intervals",
        Command::SelectIntervals { .. } => "select_intervals",
        Command::AcquireHold { .. } => "acquire_hold",
        Command::ExtendHold { .. } => "extend_hold",
        Command::ReleaseHold { .. } => "release_hold",
        Command::MarkBooked { .. } => "mark_booked",
        Command::CheckOrInsertFulfillment { .. } => "check_or_insert_fulfillment",
        Command::InsertFulfillment { .. } => "insert_fulfillment",
        Command::SelectFulfillments { .. } => "select_fulfillments",
    }
}
