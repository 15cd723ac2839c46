//! # warren
//!
//! A single-queue AMQP consumer worker built on top of [lapin](https://github.com/amqp-rs/lapin).
//!
//! A [`Worker`] owns one broker connection, subscribes to exactly one queue
//! and drives a user-supplied [`Consumer`] one delivery at a time. Around
//! the consumer it enforces the lifecycle rules that are easy to get wrong:
//! acknowledgements and rejections, the guard against acknowledging on a
//! connection other than the one that delivered, a windowed error budget
//! that escalates repeated failures into a reconnect, and a graceful drain
//! that lets an in-flight delivery finish before the process exits.
//!
//! Parallelism is process-level by design: run one worker per process and
//! let an external supervisor fork and watch them. Each worker reports to
//! its parent through a [`TelemetrySink`] and reacts to SIGTERM (stop) and
//! SIGUSR1 (stats snapshot).

// warren is 100% Safe Rust.
#![forbid(unsafe_code)]
#![warn(
    // Warns on ::path, allows crate::path.
    absolute_paths_not_starting_with_crate,

    // Warns you about missing documentation comments.
    // Writing documentation is a good idea! They will show up in your IDE as well.
    // Consider this a friendly nudge :)
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Warns you when you have dependencies you're not using.
    unused_crate_dependencies,

    // Warns on converting values using the `as` keyword.
    // Converting in this way panics in case of errors. Consider using the `Into` or `TryInto` traits instead.
    clippy::as_conversions,
)]

// Re-exporting underlying lapin version so you don't have to add the same version as a dependency.
pub use lapin;

mod budget;
mod signal;

pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod report;
pub mod state;
pub mod stats;
pub mod worker;

// pub-using every name::Name to avoid having to have warren::name::Name repetition.
// This way you can just do warren::Name.
pub use config::WorkerConfig;
pub use consumer::{Consumer, ConsumerRegistry, Outcome};
pub use error::Error;
pub use message::Message;
pub use report::{ErrorReport, ErrorSink, NullSink};
pub use state::WorkerState;
pub use stats::{telemetry_channel, Counters, StatsReport, Telemetry, TelemetrySink, Timing};
pub use worker::{Worker, WorkerHandle};

/// Convenience type for a result with `warren`'s error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    pub use super::*;

    mod budget;
    mod masking;
    mod registry;
    mod signal;
    mod state;
    mod stats;
    mod worker;

    /// Initializes tracing output for a test binary. Repeated calls are
    /// fine; only the first takes effect.
    pub fn init_logging() {
        use tracing_subscriber::EnvFilter;

        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }
}
