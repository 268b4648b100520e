use std::net::SocketAddr;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "fleetbook_bookings_created_total";

/// Counter: resources that blocked a create or update. Labels: kind, maintenance.
pub const BOOKING_CONFLICTS_TOTAL: &str = "fleetbook_booking_conflicts_total";

/// Counter: resources released back to available by cancel or complete.
pub const RESOURCES_RELEASED_TOTAL: &str = "fleetbook_resources_released_total";

/// Counter: releases refused because another booking still holds the resource.
pub const RELEASES_SKIPPED_TOTAL: &str = "fleetbook_releases_skipped_total";

/// Counter: payments recorded (direct and installment).
pub const PAYMENTS_APPLIED_TOTAL: &str = "fleetbook_payments_applied_total";

/// Counter: cached values corrected by reconciliation. Labels: kind.
pub const RECONCILE_DRIFT_TOTAL: &str = "fleetbook_reconcile_drift_total";

/// Histogram: lifecycle operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "fleetbook_operation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: lock acquisitions that hit the timeout. Labels: lock.
pub const LOCK_TIMEOUTS_TOTAL: &str = "fleetbook_lock_timeouts_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "fleetbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

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
