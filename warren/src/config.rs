//! Holds [`WorkerConfig`]'s implementation.

use std::time::Duration;

use serde_json::Value;

/// Detailed configuration of a single worker.
///
/// A config names the broker connection, the one queue to consume and the
/// registered consumer to dispatch deliveries to, plus the knobs around the
/// lifecycle: prefetch, acknowledgement mode, error budget, reconnect delay
/// and shutdown bound. It is immutable once the worker has been built.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// AMQP address of the broker, including virtual host and credentials.
    pub(crate) amqp_addr: String,
    /// The queue this worker consumes.
    pub(crate) queue: String,
    /// Registry name of the consumer implementation.
    pub(crate) consumer: String,
    /// Opaque consumer-specific configuration record.
    pub(crate) consumer_config: Option<Value>,
    /// Name of this worker; doubles as the consumer tag at the broker.
    pub(crate) worker_name: String,
    /// Symbolic name of the connection, used in logs. Error reports carry
    /// the broker address itself, password masked.
    pub(crate) connection_name: String,
    /// Prefetch count requested from the broker.
    pub(crate) prefetch: u16,
    /// Whether deliveries are acknowledged. When false the consume is
    /// started with `no_ack` and no broker responses are ever sent.
    pub(crate) ack: bool,
    /// Consumer failures within the error window before the worker
    /// reconnects.
    pub(crate) max_errors: usize,
    /// Width of the rolling error window.
    pub(crate) error_window: Duration,
    /// Pause between losing a connection and dialing the next one.
    pub(crate) reconnect_delay: Duration,
    /// Upper bound on the graceful-shutdown drain.
    pub(crate) max_shutdown_wait: Duration,
    /// AMQP heartbeat interval, in seconds.
    pub(crate) heartbeat: u16,
    /// Maximum AMQP frame size, when overridden.
    pub(crate) frame_max: Option<u32>,
}

impl WorkerConfig {
    /// The default prefetch count. One delivery in flight at a time.
    pub const DEFAULT_PREFETCH: u16 = 1;

    /// The default error-budget threshold.
    pub const DEFAULT_MAX_ERRORS: usize = 5;

    /// The default error-window width.
    pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(60);

    /// The default pause before a reconnect attempt.
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

    /// The default bound on the graceful-shutdown drain.
    pub const DEFAULT_MAX_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

    /// The default AMQP heartbeat interval, in seconds.
    pub const DEFAULT_HEARTBEAT: u16 = 300;

    /// Connection timeout applied to every dial, in milliseconds.
    pub(crate) const CONNECTION_TIMEOUT_MS: u64 = 10_000;

    /// Creates a config for consuming `queue` on `amqp_addr` with the
    /// consumer registered under `consumer`.
    ///
    /// The worker name defaults to `{consumer}-{pid}` so that several
    /// processes consuming the same queue stay distinguishable at the
    /// broker.
    pub fn new(
        amqp_addr: impl Into<String>,
        queue: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        let consumer = consumer.into();
        let worker_name = format!("{consumer}-{}", std::process::id());
        Self {
            amqp_addr: amqp_addr.into(),
            queue: queue.into(),
            consumer,
            consumer_config: None,
            worker_name,
            connection_name: "default".to_string(),
            prefetch: Self::DEFAULT_PREFETCH,
            ack: true,
            max_errors: Self::DEFAULT_MAX_ERRORS,
            error_window: Self::DEFAULT_ERROR_WINDOW,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            max_shutdown_wait: Self::DEFAULT_MAX_SHUTDOWN_WAIT,
            heartbeat: Self::DEFAULT_HEARTBEAT,
            frame_max: None,
        }
    }

    /// Sets the consumer-specific configuration record handed to the
    /// consumer factory.
    pub fn with_consumer_config(mut self, config: Value) -> Self {
        self.consumer_config = Some(config);
        self
    }

    /// Overrides the worker name. The name is used as the consumer tag and
    /// in telemetry.
    pub fn with_worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    /// Sets the symbolic connection name used in logs.
    pub fn with_connection_name(mut self, connection_name: impl Into<String>) -> Self {
        self.connection_name = connection_name.into();
        self
    }

    /// Per consumer prefetch count. See [documentation](https://www.rabbitmq.com/confirms.html#channel-qos-prefetch).
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Enables or disables acknowledgements. Disabling them starts the
    /// consume with `no_ack`; the broker considers every delivery settled
    /// as soon as it is sent.
    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Sets the error-budget threshold.
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Sets the error-window width.
    pub fn with_error_window(mut self, error_window: Duration) -> Self {
        self.error_window = error_window;
        self
    }

    /// Sets the pause between losing a connection and dialing the next one.
    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    /// Bounds the graceful-shutdown drain.
    pub fn with_max_shutdown_wait(mut self, max_shutdown_wait: Duration) -> Self {
        self.max_shutdown_wait = max_shutdown_wait;
        self
    }

    /// Sets the AMQP heartbeat interval, in seconds.
    pub fn with_heartbeat(mut self, heartbeat: u16) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Overrides the maximum AMQP frame size.
    pub fn with_frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = Some(frame_max);
        self
    }

    /// The name of this worker.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// The queue this worker consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The registry name of the consumer implementation.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// The consumer-specific configuration record, if any.
    pub fn consumer_config(&self) -> Option<&Value> {
        self.consumer_config.as_ref()
    }
}
