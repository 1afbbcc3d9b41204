use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "vanbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "vanbook_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (created, not_available).
pub const BOOKINGS_TOTAL: &str = "vanbook_bookings_total";

/// Counter: payment webhook deliveries. Labels: outcome.
pub const WEBHOOK_EVENTS_TOTAL: &str = "vanbook_webhook_events_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "vanbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "vanbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "vanbook_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "vanbook_auth_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vanbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vanbook_wal_flush_batch_size";

/// Counter: events made durable. Labels: event.
pub const EVENTS_COMMITTED_TOTAL: &str = "vanbook_events_committed_total";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "vanbook_wal_compactions_total";

/// Counter: notifications that could not be queued or delivered.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "vanbook_notification_failures_total";

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
        Command::InsertVan { .. } => "insert_van",
        Command::UpdateVanRate { .. } => "update_van_rate",
        Command::SelectVans => "select_vans",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingDates { .. } => "update_booking_dates",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertChangeRequest { .. } => "insert_change_request",
        Command::DecideChangeRequest { .. } => "decide_change_request",
        Command::SelectChangeRequests { .. } => "select_change_requests",
        Command::InsertCancellationRequest { .. } => "insert_cancellation_request",
        Command::DecideCancellationRequest { .. } => "decide_cancellation_request",
        Command::SelectCancellationRequests { .. } => "select_cancellation_requests",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::SelectAvailabilityCheck { .. } => "select_availability_check",
        Command::SelectCheckout { .. } => "select_checkout",
    }
}
