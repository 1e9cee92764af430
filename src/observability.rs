use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total engine operations. Labels: op, status.
pub const OPS_TOTAL: &str = "numpool_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "numpool_op_duration_seconds";

// ── Pool lifecycle counters ─────────────────────────────────────

pub const NUMBERS_BOOKED_TOTAL: &str = "numpool_numbers_booked_total";
pub const NUMBERS_RELEASED_TOTAL: &str = "numpool_numbers_released_total";
pub const NUMBERS_RETIRED_TOTAL: &str = "numpool_numbers_retired_total";
pub const NUMBERS_EXPIRED_TOTAL: &str = "numpool_numbers_expired_total";

/// Counter: notices dropped after exhausting delivery retries.
pub const NOTIFY_FAILURES_TOTAL: &str = "numpool_notify_failures_total";

/// Counter: archive writes that failed after the retirement committed.
pub const ARCHIVE_FAILURES_TOTAL: &str = "numpool_archive_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "numpool_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "numpool_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Record one operation's outcome and latency.
pub(crate) fn record_op<T>(op: &'static str, result: &Result<T, EngineError>, start: Instant) {
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(OPS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OP_DURATION_SECONDS, "op" => op).record(start.elapsed().as_secs_f64());
}
