use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, method, status.
pub const REQUESTS_TOTAL: &str = "fitslot_requests_total";

/// Histogram: request latency in seconds. Labels: route, method.
pub const REQUEST_DURATION_SECONDS: &str = "fitslot_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: path (client|trainer), outcome.
pub const BOOKINGS_TOTAL: &str = "fitslot_bookings_total";

/// Counter: availability consolidations that absorbed at least one slot.
pub const MERGES_TOTAL: &str = "fitslot_merges_total";

/// Counter: manual slots replaced by their remainders after a booking.
pub const SPLITS_TOTAL: &str = "fitslot_splits_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: trainer calendars held in memory.
pub const CALENDARS_LOADED: &str = "fitslot_calendars_loaded";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fitslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (changes per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fitslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Short label for a booking result.
pub fn booking_outcome<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Validation(_) | EngineError::LimitExceeded(_)) => "invalid",
        Err(EngineError::Unauthorized(_)) => "unauthorized",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::Collaborator(_) | EngineError::WalError(_)) => "error",
    }
}
