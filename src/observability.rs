use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Counter: outbound notifications. Labels: status (sent, failed).
pub const NOTIFICATIONS_TOTAL: &str = "slotbook_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of loaded studios.
pub const STUDIOS_ACTIVE: &str = "slotbook_studios_active";

/// Counter: logins that did not resolve to a principal.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertProfile { .. } => "insert_profile",
        Command::VerifyProfile { .. } => "verify_profile",
        Command::InsertSubject { .. } => "insert_subject",
        Command::InsertShift { .. } => "insert_shift",
        Command::UpdateShift { .. } => "update_shift",
        Command::DeleteShift { .. } => "delete_shift",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::SelectAvailability(_) => "select_availability",
        Command::SelectProfiles => "select_profiles",
        Command::SelectSubjects => "select_subjects",
        Command::SelectShifts => "select_shifts",
        Command::SelectReservations => "select_reservations",
        Command::SelectStats => "select_stats",
        Command::SelectExport(_) => "select_export",
    }
}
