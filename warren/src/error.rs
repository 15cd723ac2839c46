//! Warren-specific error types.

use thiserror::Error as ThisError;

/// Errors that may be returned by `warren`, especially while setting up or
/// running a worker.
///
/// Setup errors ([`Error::UnknownConsumer`], [`Error::ConsumerSetup`] and
/// [`Error::InvalidAddress`]) are fatal: the worker never starts and the
/// supervisor is expected to exit the process with a non-zero code. Broker
/// errors encountered while the worker runs are not surfaced through this
/// type at all; the worker absorbs them and reconnects.
#[derive(Debug, ThisError)]
pub enum Error {
    /// No consumer was registered under the configured name.
    #[error("No consumer named {0:?} has been registered.")]
    UnknownConsumer(String),

    /// A consumer factory failed while constructing its consumer.
    #[error("Failed to construct consumer {name:?}: {reason}")]
    ConsumerSetup {
        /// The registry name of the consumer.
        name: String,
        /// The factory's description of what went wrong.
        reason: String,
    },

    /// The configured AMQP address could not be parsed.
    #[error("Invalid AMQP address: {0}")]
    InvalidAddress(String),

    /// The worker's signal handlers could not be installed.
    #[error("Failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),

    /// An error from an underlying `lapin` call.
    #[error("An underlying `lapin` call failed: {0}")]
    Lapin(#[from] lapin::Error),
}
