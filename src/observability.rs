use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomd_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking status changes. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roomd_booking_transitions_total";

/// Counter: requests refused because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "roomd_slot_conflicts_total";

/// Counter: payment provider events. Labels: type, outcome.
pub const PAYMENT_EVENTS_TOTAL: &str = "roomd_payment_events_total";

/// Counter: rows touched by the background sweep. Labels: kind.
pub const REAPER_SWEPT_TOTAL: &str = "roomd_reaper_swept_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "roomd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomd_wal_flush_batch_size";

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
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertWindow { .. } => "insert_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertVisitor { .. } => "insert_visitor",
        Command::UpdateVisitor { .. } => "update_visitor",
        Command::InsertAdmin { .. } => "insert_admin",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::ApproveBooking { .. } => "approve_booking",
        Command::RejectBooking { .. } => "reject_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::InsertCheckout { .. } => "insert_checkout",
        Command::InsertPaymentEvent { .. } => "insert_payment_event",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectVisitors { .. } => "select_visitors",
        Command::SelectAdmins => "select_admins",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectSlot { .. } => "select_availability",
        Command::SelectFreeSlots { .. } => "select_free_slots",
        Command::SelectStats => "select_stats",
    }
}
