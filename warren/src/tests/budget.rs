//! Tests of the windowed error budget.

use std::time::{Duration, Instant};

use crate::budget::ErrorBudget;

const WINDOW: Duration = Duration::from_secs(60);

#[test]
fn trips_at_the_threshold() {
    let mut budget = ErrorBudget::new(3, WINDOW);
    let base = Instant::now();

    assert!(!budget.record_failure(base));
    assert!(!budget.record_failure(base + Duration::from_secs(5)));
    assert!(budget.record_failure(base + Duration::from_secs(10)));
    assert_eq!(budget.count(), 3);
}

#[test]
fn failures_outside_the_window_start_a_fresh_count() {
    let mut budget = ErrorBudget::new(2, WINDOW);
    let base = Instant::now();

    assert!(!budget.record_failure(base));
    // More than a window later: the count restarts at one.
    assert!(!budget.record_failure(base + Duration::from_secs(61)));
    assert_eq!(budget.count(), 1);
    // But a second failure close behind it trips.
    assert!(budget.record_failure(base + Duration::from_secs(62)));
}

#[test]
fn failures_on_the_window_edge_still_count() {
    let mut budget = ErrorBudget::new(2, WINDOW);
    let base = Instant::now();

    assert!(!budget.record_failure(base));
    assert!(budget.record_failure(base + WINDOW));
}

#[test]
fn reset_clears_the_count() {
    let mut budget = ErrorBudget::new(2, WINDOW);
    let base = Instant::now();

    assert!(!budget.record_failure(base));
    budget.reset();
    assert_eq!(budget.count(), 0);
    assert!(!budget.record_failure(base + Duration::from_secs(1)));
}

#[test]
fn a_threshold_of_one_trips_immediately() {
    let mut budget = ErrorBudget::new(1, WINDOW);
    assert!(budget.record_failure(Instant::now()));
}
