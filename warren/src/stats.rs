//! In-process counters and timings, and the telemetry channel that carries
//! them to the parent supervisor.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::state::WorkerState;

/// Per-lifetime delivery counters for one worker.
///
/// For every delivery that terminates, exactly one of `acked`, `requeued`,
/// `rejected` or `closed_on_complete` is incremented (when acknowledgements
/// are enabled). `processed` counts only successful completions, including
/// those whose acknowledgement was suppressed because the delivering
/// connection was already gone.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Counters {
    /// Deliveries acknowledged at the broker.
    pub acked: u64,
    /// Deliveries rejected without requeue.
    pub rejected: u64,
    /// Deliveries rejected with requeue.
    pub requeued: u64,
    /// Deliveries the consumer completed successfully.
    pub processed: u64,
    /// Deliveries the consumer failed to process.
    pub failed: u64,
    /// Deliveries the broker flagged as redelivered.
    pub redelivered: u64,
    /// Consumer invocations that panicked.
    pub unhandled_exceptions: u64,
    /// Completions whose broker response was suppressed because the
    /// delivering connection was no longer current.
    pub closed_on_complete: u64,
    /// Times the worker re-established its broker connection.
    pub reconnected: u64,
}

/// An accumulated duration and the number of samples that produced it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Sum of all samples.
    pub total: Duration,
    /// Number of samples.
    pub samples: u64,
}

impl Timing {
    /// Records one sample.
    pub(crate) fn add(&mut self, sample: Duration) {
        self.total += sample;
        self.samples += 1;
    }

    /// The mean sample, if any samples have been recorded.
    pub fn mean(&self) -> Option<Duration> {
        u32::try_from(self.samples).ok().and_then(|samples| {
            (samples > 0).then(|| self.total / samples)
        })
    }
}

/// The worker's in-process stats store.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    /// Lifetime counters.
    pub(crate) counts: Counters,
    /// The counters as of the previous report.
    previous: Counters,
    /// Time spent inside the consumer.
    pub(crate) processing_time: Timing,
    /// Time spent idle between deliveries.
    pub(crate) idle_time: Timing,
}

impl Stats {
    /// Creates an empty stats store.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Produces a snapshot and rotates the current counters into the
    /// previous slot.
    ///
    /// Counters themselves keep accumulating for the worker's lifetime; the
    /// rotation only gives the parent a basis for velocity, which it derives
    /// as the processed delta over the report interval.
    pub(crate) fn report(&mut self, state: WorkerState, state_age: Duration) -> StatsReport {
        let report = StatsReport {
            counts: self.counts.clone(),
            previous: self.previous.clone(),
            processing_time: self.processing_time,
            idle_time: self.idle_time,
            state,
            state_age,
        };
        self.previous = self.counts.clone();
        report
    }
}

/// A point-in-time snapshot of one worker's counters and timings.
#[derive(Debug, Clone)]
pub struct StatsReport {
    /// The lifetime counters at the time of the report.
    pub counts: Counters,
    /// The counters as of the previous report. Velocity is
    /// `(counts.processed - previous.processed)` over the report interval.
    pub previous: Counters,
    /// Time spent inside the consumer.
    pub processing_time: Timing,
    /// Time spent idle between deliveries.
    pub idle_time: Timing,
    /// The worker's lifecycle state at the time of the report.
    pub state: WorkerState,
    /// How long the worker had been in that state.
    pub state_age: Duration,
}

/// Messages a worker pushes to its parent supervisor.
#[derive(Debug, Clone)]
pub enum Telemetry {
    /// A stats snapshot, produced on demand.
    Stats(StatsReport),
    /// The worker finished its drain and is about to exit.
    Stopped {
        /// The name of the worker that stopped.
        worker: String,
    },
}

/// The worker's write-only telemetry endpoint.
///
/// Sends never block the event loop; messages buffer until the parent reads
/// them, and a parent that has gone away loses telemetry without affecting
/// the worker.
pub type TelemetrySink = mpsc::UnboundedSender<Telemetry>;

/// Creates a telemetry channel: the sink half is given to a worker, the
/// receiver half is read by the supervisor.
#[must_use]
pub fn telemetry_channel() -> (TelemetrySink, mpsc::UnboundedReceiver<Telemetry>) {
    mpsc::unbounded_channel()
}
