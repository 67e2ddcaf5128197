use std::net::SocketAddr;

// ── Planning operations ─────────────────────────────────────────

/// Counter: mutating operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "venueplan_operations_total";

/// Histogram: mutating operation latency in seconds, lock wait included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "venueplan_operation_duration_seconds";

/// Counter: candidate intervals rejected for blocking overlaps. Labels: op.
pub const CONFLICTS_TOTAL: &str = "venueplan_conflicts_total";

/// Histogram: time spent waiting for the planning lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "venueplan_lock_wait_seconds";

/// Counter: operations that gave up waiting for the planning lock.
pub const LOCK_BUSY_TOTAL: &str = "venueplan_lock_busy_total";

/// Gauge: persisted states.
pub const STATES_STORED: &str = "venueplan_states_stored";

// ── Side effects ────────────────────────────────────────────────

/// Counter: transition triggers. Labels: trigger, status.
pub const TRIGGERS_TOTAL: &str = "venueplan_triggers_total";

/// Counter: scheduler wake-ups that observed a timed transition.
pub const SCHEDULER_TRANSITIONS_TOTAL: &str = "venueplan_scheduler_transitions_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "venueplan_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "venueplan_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
