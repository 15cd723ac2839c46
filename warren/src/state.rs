//! The worker lifecycle state machine.

use std::fmt;
use std::time::Instant;

use tracing::{debug, error};

/// The lifecycle state of a [`Worker`](crate::Worker).
///
/// A worker starts in [`Initializing`](WorkerState::Initializing) and ends in
/// [`Stopped`](WorkerState::Stopped). The transitions in between are guarded
/// by [`Lifecycle::set`]; anything outside the legal set is logged and
/// refused rather than applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, or waiting between reconnect attempts.
    Initializing,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and subscribed, waiting for a delivery.
    Idle,
    /// A delivery is being processed by the consumer.
    Processing,
    /// A stop arrived mid-delivery; shutdown is deferred until the consumer
    /// returns.
    StopRequested,
    /// The drain is running.
    ShuttingDown,
    /// The drain finished; the worker will not run again.
    Stopped,
}

impl WorkerState {
    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    fn allows(self, next: WorkerState) -> bool {
        use WorkerState::{
            Connecting, Idle, Initializing, Processing, ShuttingDown, StopRequested, Stopped,
        };

        match (self, next) {
            (Initializing, Connecting) => true,
            (Connecting, Idle | Initializing) => true,
            (Idle, Processing | StopRequested | ShuttingDown) => true,
            (Processing, Idle | StopRequested) => true,
            (StopRequested, ShuttingDown) => true,
            (ShuttingDown, Stopped) => true,
            // A lost link forces a reconnect from any state that is not
            // already on the way out.
            (from, Connecting) => !matches!(from, StopRequested | ShuttingDown | Stopped),
            // A stop that arrives while disconnected drains straight from
            // the connect path.
            (Initializing | Connecting, ShuttingDown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Connecting => "connecting",
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::StopRequested => "stop requested",
            WorkerState::ShuttingDown => "shutting down",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The worker's current state together with when it was entered.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    /// The current state.
    state: WorkerState,
    /// When `state` was entered.
    since: Instant,
}

impl Lifecycle {
    /// Creates a lifecycle in [`WorkerState::Initializing`].
    pub(crate) fn new() -> Self {
        Self {
            state: WorkerState::Initializing,
            since: Instant::now(),
        }
    }

    /// The current state.
    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    /// When the current state was entered.
    pub(crate) fn since(&self) -> Instant {
        self.since
    }

    /// Transitions to `next`, refreshing the state timestamp.
    ///
    /// An illegal transition is logged at error level and the state is left
    /// unchanged.
    pub(crate) fn set(&mut self, next: WorkerState) {
        if !self.state.allows(next) {
            error!("Refusing unexpected state transition: {} -> {next}", self.state);
            return;
        }
        debug!("State transition: {} -> {next}", self.state);
        self.state = next;
        self.since = Instant::now();
    }

    /// True while connected and waiting for a delivery.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// True while a connection attempt is in flight.
    pub(crate) fn is_connecting(&self) -> bool {
        self.state == WorkerState::Connecting
    }

    /// True while a delivery is being processed.
    pub(crate) fn is_processing(&self) -> bool {
        self.state == WorkerState::Processing
    }

    /// True when a stop arrived mid-delivery and shutdown is deferred.
    pub(crate) fn is_waiting_to_shutdown(&self) -> bool {
        self.state == WorkerState::StopRequested
    }

    /// True while the drain is running.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.state == WorkerState::ShuttingDown
    }

    /// True once the drain has finished.
    pub(crate) fn is_stopped(&self) -> bool {
        self.state == WorkerState::Stopped
    }

    /// True while a delivery is in flight, whether or not a stop has been
    /// requested in the meantime.
    pub(crate) fn is_processing_or_stop_requested(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Processing | WorkerState::StopRequested
        )
    }

    /// True unless the worker is stopping or stopped.
    pub(crate) fn is_running(&self) -> bool {
        !matches!(
            self.state,
            WorkerState::StopRequested | WorkerState::ShuttingDown | WorkerState::Stopped
        )
    }
}
