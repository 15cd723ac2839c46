//! Tests of the stats store and its report rotation.

use std::time::Duration;

use crate::state::WorkerState;
use crate::stats::{Stats, Timing};

#[test]
fn report_rotates_counts_into_previous() {
    let mut stats = Stats::new();
    stats.counts.processed += 1;
    stats.counts.acked += 1;

    let first = stats.report(WorkerState::Idle, Duration::from_secs(1));
    assert_eq!(first.counts.processed, 1);
    assert_eq!(first.previous.processed, 0);

    stats.counts.processed += 2;
    let second = stats.report(WorkerState::Idle, Duration::from_secs(1));
    // Counters accumulate for the worker's lifetime; the previous slot is
    // the velocity basis.
    assert_eq!(second.counts.processed, 3);
    assert_eq!(second.previous.processed, 1);
    assert_eq!(second.counts.acked, 1);
    assert_eq!(second.previous.acked, 1);
}

#[test]
fn report_captures_the_lifecycle() {
    let mut stats = Stats::new();
    let report = stats.report(WorkerState::Processing, Duration::from_millis(250));
    assert_eq!(report.state, WorkerState::Processing);
    assert_eq!(report.state_age, Duration::from_millis(250));
}

#[test]
fn timings_accumulate() {
    let mut timing = Timing::default();
    assert_eq!(timing.mean(), None);

    timing.add(Duration::from_millis(10));
    timing.add(Duration::from_millis(30));
    assert_eq!(timing.samples, 2);
    assert_eq!(timing.total, Duration::from_millis(40));
    assert_eq!(timing.mean(), Some(Duration::from_millis(20)));
}

#[test]
fn processing_and_idle_timings_are_independent() {
    let mut stats = Stats::new();
    stats.processing_time.add(Duration::from_millis(5));
    stats.idle_time.add(Duration::from_secs(2));

    let report = stats.report(WorkerState::Idle, Duration::ZERO);
    assert_eq!(report.processing_time.samples, 1);
    assert_eq!(report.idle_time.total, Duration::from_secs(2));
}
