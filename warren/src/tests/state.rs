//! Tests of the worker lifecycle state machine.

use std::time::Duration;

use crate::state::{Lifecycle, WorkerState};

/// Walks a lifecycle through the given states, asserting each transition
/// is accepted.
fn walk(lifecycle: &mut Lifecycle, states: &[WorkerState]) {
    for &state in states {
        lifecycle.set(state);
        assert_eq!(lifecycle.state(), state, "transition to {state} was refused");
    }
}

#[test]
fn starts_initializing() {
    let lifecycle = Lifecycle::new();
    assert_eq!(lifecycle.state(), WorkerState::Initializing);
    assert!(lifecycle.is_running());
    assert!(!lifecycle.is_idle());
    assert!(!lifecycle.is_processing());
    assert!(!lifecycle.is_stopped());
}

#[test]
fn full_lifecycle_is_legal() {
    let mut lifecycle = Lifecycle::new();
    walk(
        &mut lifecycle,
        &[
            WorkerState::Connecting,
            WorkerState::Idle,
            WorkerState::Processing,
            WorkerState::Idle,
            WorkerState::Processing,
            WorkerState::StopRequested,
            WorkerState::ShuttingDown,
            WorkerState::Stopped,
        ],
    );
    assert!(lifecycle.is_stopped());
}

#[test]
fn stop_while_idle_drains_directly() {
    let mut lifecycle = Lifecycle::new();
    walk(
        &mut lifecycle,
        &[
            WorkerState::Connecting,
            WorkerState::Idle,
            WorkerState::ShuttingDown,
            WorkerState::Stopped,
        ],
    );
}

#[test]
fn illegal_transition_is_refused() {
    let mut lifecycle = Lifecycle::new();
    lifecycle.set(WorkerState::Processing);
    assert_eq!(lifecycle.state(), WorkerState::Initializing);

    lifecycle.set(WorkerState::Connecting);
    lifecycle.set(WorkerState::Stopped);
    assert_eq!(lifecycle.state(), WorkerState::Connecting);
}

#[test]
fn lost_link_reconnects_from_idle() {
    let mut lifecycle = Lifecycle::new();
    walk(
        &mut lifecycle,
        &[
            WorkerState::Connecting,
            WorkerState::Idle,
            WorkerState::Connecting,
        ],
    );
    assert!(lifecycle.is_connecting());
}

#[test]
fn stopping_states_refuse_reconnect() {
    let mut lifecycle = Lifecycle::new();
    walk(
        &mut lifecycle,
        &[
            WorkerState::Connecting,
            WorkerState::Idle,
            WorkerState::Processing,
            WorkerState::StopRequested,
        ],
    );

    lifecycle.set(WorkerState::Connecting);
    assert_eq!(lifecycle.state(), WorkerState::StopRequested);

    lifecycle.set(WorkerState::ShuttingDown);
    lifecycle.set(WorkerState::Connecting);
    assert_eq!(lifecycle.state(), WorkerState::ShuttingDown);

    lifecycle.set(WorkerState::Stopped);
    lifecycle.set(WorkerState::Connecting);
    assert_eq!(lifecycle.state(), WorkerState::Stopped);
}

#[test]
fn stop_while_disconnected_drains_from_the_connect_path() {
    let mut lifecycle = Lifecycle::new();
    lifecycle.set(WorkerState::Connecting);
    walk(
        &mut lifecycle,
        &[WorkerState::ShuttingDown, WorkerState::Stopped],
    );
}

#[test]
fn failed_connect_retries_from_scratch() {
    let mut lifecycle = Lifecycle::new();
    walk(
        &mut lifecycle,
        &[
            WorkerState::Connecting,
            WorkerState::Initializing,
            WorkerState::Connecting,
        ],
    );
}

#[test]
fn predicates_track_state() {
    let mut lifecycle = Lifecycle::new();
    lifecycle.set(WorkerState::Connecting);
    assert!(lifecycle.is_connecting());

    lifecycle.set(WorkerState::Idle);
    assert!(lifecycle.is_idle());
    assert!(!lifecycle.is_processing_or_stop_requested());

    lifecycle.set(WorkerState::Processing);
    assert!(lifecycle.is_processing());
    assert!(lifecycle.is_processing_or_stop_requested());
    assert!(lifecycle.is_running());

    lifecycle.set(WorkerState::StopRequested);
    assert!(lifecycle.is_waiting_to_shutdown());
    assert!(lifecycle.is_processing_or_stop_requested());
    assert!(!lifecycle.is_running());

    lifecycle.set(WorkerState::ShuttingDown);
    assert!(lifecycle.is_shutting_down());

    lifecycle.set(WorkerState::Stopped);
    assert!(lifecycle.is_stopped());
}

#[test]
fn transitions_refresh_the_timestamp() {
    let mut lifecycle = Lifecycle::new();
    let before = lifecycle.since();
    std::thread::sleep(Duration::from_millis(5));
    lifecycle.set(WorkerState::Connecting);
    assert!(lifecycle.since() > before);
}
