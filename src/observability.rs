use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tourdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tourdesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tourdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tourdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tourdesk_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tourdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tourdesk_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_CREATED_TOTAL: &str = "tourdesk_bookings_created_total";

/// Counter: booking requests refused. Labels: code.
pub const BOOKING_REJECTIONS_TOTAL: &str = "tourdesk_booking_rejections_total";

/// Counter: booking status changes. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "tourdesk_booking_transitions_total";

/// Counter: proposals approved or rejected. Labels: outcome.
pub const PROPOSALS_RESOLVED_TOTAL: &str = "tourdesk_proposals_resolved_total";

/// Counter: background sweep actions. Labels: task.
pub const REAPER_ACTIONS_TOTAL: &str = "tourdesk_reaper_actions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateBooking(_) => "create_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::DecideBooking { .. } => "decide_booking",
        Command::AssignGuide { .. } => "assign_guide",
        Command::ConfirmPayment { .. } => "confirm_payment",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::RecordRefund { .. } => "record_refund",
        Command::SubmitProposal { .. } => "submit_proposal",
        Command::ReviewProposal { .. } => "review_proposal",
        Command::AddBusyMarker { .. } => "add_busy_marker",
        Command::RemoveBusyMarker { .. } => "remove_busy_marker",
        Command::RegisterCatalogEntry { .. } => "register_catalog_entry",
        Command::RemoveCatalogEntry { .. } => "remove_catalog_entry",
        Command::SelectCapacity { .. } => "select_capacity",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectProposals { .. } => "select_proposals",
        Command::SelectTours => "select_tours",
        Command::SelectCheckout { .. } => "select_checkout",
        Command::SelectBusyMarkers { .. } => "select_busy_markers",
        Command::SelectCatalog(_) => "select_catalog",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
