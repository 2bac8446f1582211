use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomd_query_duration_seconds";

/// Counter: reservation attempts. Labels: status (created, conflict, invalid, error).
pub const RESERVATIONS_TOTAL: &str = "roomd_reservations_total";

/// Histogram: end-to-end reservation latency in seconds, lock wait included.
pub const RESERVE_DURATION_SECONDS: &str = "roomd_reserve_duration_seconds";

// ── Locking and transactions ────────────────────────────────────

/// Histogram: time spent waiting for a room lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "roomd_lock_wait_seconds";

/// Gauge: entries in the room lock table.
pub const LOCK_TABLE_SIZE: &str = "roomd_lock_table_size";

/// Counter: idle lock entries evicted by the sweeper.
pub const LOCK_ENTRIES_EVICTED_TOTAL: &str = "roomd_lock_entries_evicted_total";

pub const TX_COMMITS_TOTAL: &str = "roomd_tx_commits_total";

pub const TX_ROLLBACKS_TOTAL: &str = "roomd_tx_rollbacks_total";

/// Counter: commits refused because a concurrent commit changed what the
/// transaction read.
pub const SERIALIZATION_FAILURES_TOTAL: &str = "roomd_serialization_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectReservations { .. } => "select_reservations",
    }
}
