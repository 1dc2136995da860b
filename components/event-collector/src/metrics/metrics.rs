// External crates
use lazy_static::lazy_static;
use prometheus::{Counter, Histogram, register_counter, register_histogram};
use std::time::Instant;

/// Helper to observe histogram duration
pub fn observe_duration(hist: &Histogram, start: Instant) {
    let elapsed = start.elapsed().as_secs_f64();
    hist.observe(elapsed);
}

lazy_static! {
    // ======== Collection Cycle Metrics ========

    pub static ref CYCLES_TOTAL: Counter = register_counter!(
        "vmwarelog_cycles_total",
        "Number of collection cycles started"
    ).unwrap();

    pub static ref CYCLES_FAILED_TOTAL: Counter = register_counter!(
        "vmwarelog_cycles_failed_total",
        "Number of collection cycles that persisted nothing because of an error"
    ).unwrap();

    pub static ref CYCLE_DURATION_SECONDS: Histogram = register_histogram!(
        "vmwarelog_cycle_duration_seconds",
        "Histogram of collection durations from cursor acquisition to sorted events (seconds)",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // ======== Gateway Metrics ========

    pub static ref CURSOR_ACQUIRE_ATTEMPTS_TOTAL: Counter = register_counter!(
        "vmwarelog_cursor_acquire_attempts_total",
        "Number of connect + create collector attempts, retries included"
    ).unwrap();

    pub static ref CURSOR_ACQUIRE_FAILURES_TOTAL: Counter = register_counter!(
        "vmwarelog_cursor_acquire_failures_total",
        "Number of cycles that gave up acquiring an event cursor"
    ).unwrap();

    pub static ref PAGES_READ_TOTAL: Counter = register_counter!(
        "vmwarelog_pages_read_total",
        "Number of non-empty event pages read"
    ).unwrap();

    pub static ref EVENTS_READ_TOTAL: Counter = register_counter!(
        "vmwarelog_events_read_total",
        "Number of events read from event cursors"
    ).unwrap();

    // ======== Sink Metrics ========

    pub static ref EVENTS_WRITTEN_TOTAL: Counter = register_counter!(
        "vmwarelog_events_written_total",
        "Number of events appended to the output file"
    ).unwrap();

    pub static ref EVENTS_SKIPPED_TOTAL: Counter = register_counter!(
        "vmwarelog_events_skipped_total",
        "Number of events skipped because they could not be serialized"
    ).unwrap();
}
