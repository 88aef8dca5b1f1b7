use tracing::trace;

// Metric-shaped trace events on `thrift.metrics`. They go to the log
// subscriber only; nothing here feeds the Prometheus recorder.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "thrift.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "thrift.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn tryon_outcome(tier: &'static str) {
    trace!(target = "thrift.metrics", tier = tier, "tryon_outcome_inc");
}

pub fn poll_attempt(job_id: &str, attempt: u32) {
    trace!(
        target = "thrift.metrics",
        job_id = job_id,
        attempt = attempt,
        "tryon_poll"
    );
}
