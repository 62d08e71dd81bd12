use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "stocklock_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "stocklock_op_duration_seconds";

/// Counter: holds released. Labels: reason.
pub const RELEASES_TOTAL: &str = "stocklock_releases_total";

// ── Consistency & background work ───────────────────────────────

/// Counter: commits where the counter-side consume exhausted retries
/// after the durable decrement landed.
pub const COMMIT_DIVERGENCE_TOTAL: &str = "stocklock_commit_divergence_total";

/// Counter: holds released by the reaper.
pub const REAPER_SWEPT_TOTAL: &str = "stocklock_reaper_swept_total";

/// Histogram: reaper sweep duration in seconds.
pub const REAPER_SWEEP_DURATION_SECONDS: &str = "stocklock_reaper_sweep_duration_seconds";

/// Expose the metrics above over Prometheus HTTP. Pass `None` to run
/// without an exporter (tests, embedders with their own recorder).
///
/// # Errors
///
/// Returns an error if the listener cannot bind or a global recorder is
/// already installed.
pub fn init(addr: Option<SocketAddr>) -> Result<(), EngineError> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Internal(format!("metrics exporter install failed: {e}")))?;
    tracing::info!(%addr, "serving Prometheus metrics");
    Ok(())
}

/// Record outcome counter + latency histogram for one engine operation.
pub(crate) fn record_op<T>(
    op: &'static str,
    started: Instant,
    result: &Result<T, EngineError>,
) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(OPS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OP_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}
