//! [`Consumer`]s process the deliveries a worker receives, and the
//! [`ConsumerRegistry`] is how workers find them by name.

use std::collections::HashMap;

use async_trait::async_trait;
use lapin::Channel;
use serde_json::Value;
use tracing::debug;

use crate::message::Message;
use crate::stats::TelemetrySink;
use crate::{Error, Result};

/// The consumer's verdict on a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The delivery was processed. It is acknowledged when acknowledgements
    /// are enabled.
    Accept,
    /// The delivery could not be processed this time. It is rejected with
    /// requeue, so the broker offers it again.
    Requeue,
    /// The delivery itself is unprocessable. It is rejected without
    /// requeue; the broker drops or dead-letters it.
    Discard(String),
}

/// A message consumer, owned by one worker for the worker's full lifetime.
///
/// [`execute`](Consumer::execute) may suspend; the worker awaits it
/// cooperatively, and that await is the only point at which stop requests,
/// stats requests and broker closures interleave with processing. A panic
/// inside `execute` is treated as an unhandled exception: the delivery is
/// rejected with requeue, the failure counts against the error budget, and
/// a report is forwarded to the configured error sink.
///
/// The capability methods have no-op defaults, so consumers implement only
/// what they need.
#[async_trait]
pub trait Consumer: Send {
    /// Processes one delivery and returns its fate.
    async fn execute(&mut self, message: &Message) -> Outcome;

    /// Called with the worker's channel every time one is (re)opened.
    ///
    /// Useful for consumers that publish follow-up messages. The channel is
    /// replaced on every reconnect; consumers should keep only the most
    /// recent one.
    fn on_channel(&mut self, channel: Channel) {
        let _ = channel;
    }

    /// Called once at setup with the worker's telemetry sink.
    fn on_telemetry(&mut self, sink: TelemetrySink) {
        let _ = sink;
    }

    /// Called once during the worker's drain, before the process exits.
    async fn shutdown(&mut self) {}
}

impl std::fmt::Debug for dyn Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Consumer")
    }
}

/// A consumer factory: builds a consumer from its optional configuration
/// record. A factory error is fatal at worker setup.
type ConsumerFactory =
    Box<dyn Fn(Option<&Value>) -> std::result::Result<Box<dyn Consumer>, String> + Send + Sync>;

/// A string-keyed registry of consumer factories.
///
/// The registry is populated once at program start; workers then look their
/// consumer up by the name carried in their configuration. This replaces
/// resolving dotted class paths at runtime: the set of consumers a binary
/// can run is fixed when it is built.
#[derive(Default)]
pub struct ConsumerRegistry {
    /// Registered factories by consumer name.
    factories: HashMap<String, ConsumerFactory>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer factory under the given name. A later
    /// registration under the same name replaces the earlier one.
    pub fn register<F, C>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Option<&Value>) -> std::result::Result<C, String> + Send + Sync + 'static,
        C: Consumer + 'static,
    {
        let name = name.into();
        debug!("Registering consumer factory {name:?}");
        self.factories.insert(
            name,
            Box::new(move |config| factory(config).map(|c| Box::new(c) as Box<dyn Consumer>)),
        );
    }

    /// Builds the consumer registered under `name`.
    ///
    /// # Errors
    /// Returns [`Error::UnknownConsumer`] when nothing is registered under
    /// `name`, and [`Error::ConsumerSetup`] when the factory fails. Both
    /// are fatal at worker setup; the process is expected to exit non-zero.
    pub fn build(&self, name: &str, config: Option<&Value>) -> Result<Box<dyn Consumer>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownConsumer(name.to_string()))?;
        factory(config).map_err(|reason| Error::ConsumerSetup {
            name: name.to_string(),
            reason,
        })
    }
}
