use std::net::SocketAddr;

use crate::wire::Request;

// ── Request metrics ──────────────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "swimbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "swimbook_request_duration_seconds";

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "swimbook_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "swimbook_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "swimbook_connections_rejected_total";

// ── Reservation metrics ─────────────────────────────────────

/// Counter: holds granted. Labels: mode (acquired, renewed).
pub const HOLDS_ACQUIRED_TOTAL: &str = "swimbook_holds_acquired_total";

/// Counter: hold requests refused. Labels: kind.
pub const HOLDS_REJECTED_TOTAL: &str = "swimbook_holds_rejected_total";

/// Counter: holds given back by their holder.
pub const HOLDS_RELEASED_TOTAL: &str = "swimbook_holds_released_total";

/// Counter: lapsed hold records purged by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "swimbook_holds_reaped_total";

/// Counter: bookings confirmed (one per session instance).
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "swimbook_bookings_confirmed_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "swimbook_bookings_cancelled_total";

/// Counter: bookings moved to another session.
pub const BOOKINGS_RESCHEDULED_TOTAL: &str = "swimbook_bookings_rescheduled_total";

/// Counter: booking attempts that ended in Failed. Labels: kind.
pub const BOOKING_ATTEMPTS_FAILED_TOTAL: &str = "swimbook_booking_attempts_failed_total";

// ── Journal ──────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "swimbook_journal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "swimbook_journal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a request.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::AcquireHold { .. } => "acquire_hold",
        Request::ReleaseHold { .. } => "release_hold",
        Request::GetHold { .. } => "get_hold",
        Request::CheckConflict { .. } => "check_conflict",
        Request::ResolveRecurring { .. } => "resolve_recurring",
        Request::ConfirmBooking { .. } => "confirm_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::RescheduleBooking { .. } => "reschedule_booking",
        Request::CancelSeries { .. } => "cancel_series",
        Request::ListBookings { .. } => "list_bookings",
        Request::ListInstances { .. } => "list_instances",
        Request::CreateInstance { .. } => "create_instance",
        Request::SuggestAlternatives { .. } => "suggest_alternatives",
        Request::Watch { .. } => "watch",
    }
}
