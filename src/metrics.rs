use tracing::trace;

// Trace-level metric events. A subscriber or log pipeline aggregates them;
// the crate itself installs no recorder.

pub fn decision(decision: &'static str, source: &'static str) {
    trace!(
        target = "moderation.metrics",
        decision = decision,
        source = source,
        "moderation_decisions_total_inc"
    );
}

pub fn image_fetch(outcome: &'static str, attempts: u32) {
    trace!(
        target = "moderation.metrics",
        outcome = outcome,
        attempts = attempts,
        "image_fetch_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "moderation.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
