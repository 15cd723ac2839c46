//! The [`Worker`]: one connection, one queue, one consumer, one event loop.
//!
//! A worker is driven by a single cooperative loop. The broker's events
//! (connection errors, deliveries), OS signals and programmatic control
//! requests all surface as values inside that loop, so every piece of state
//! is touched from exactly one task and no locking is needed. The only
//! suspension point while a delivery is in flight is the await on the
//! consumer itself; that is where stop requests, stats requests and broker
//! closures interleave with processing.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    BasicRecoverOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::budget::ErrorBudget;
use crate::config::WorkerConfig;
use crate::consumer::{Consumer, ConsumerRegistry, Outcome};
use crate::message::Message;
use crate::report::{mask_uri_password, masked_environment, ErrorReport, ErrorSink, NullSink};
use crate::signal::{SignalEvent, Signals};
use crate::state::{Lifecycle, WorkerState};
use crate::stats::{Stats, Telemetry, TelemetrySink};
use crate::{Error, Result};

/// Control events injected into the event loop from outside the worker,
/// either programmatically through a [`WorkerHandle`] or mapped from an OS
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Begin a graceful stop.
    Stop,
    /// Push a stats snapshot to the parent.
    ReportStats,
}

impl From<SignalEvent> for Control {
    fn from(event: SignalEvent) -> Self {
        match event {
            SignalEvent::Stop => Self::Stop,
            SignalEvent::Stats => Self::ReportStats,
        }
    }
}

/// A connection error posted into the event loop by the `on_error`
/// callback, tagged with the epoch of the connection that produced it so
/// that events from connections already discarded are ignored.
#[derive(Debug)]
struct ConnectionEvent {
    /// The epoch of the connection the error belongs to.
    epoch: u64,
    /// The underlying error.
    error: lapin::Error,
}

/// Why a consume session ended.
enum Flow {
    /// The connection is gone or poisoned; pause and dial again.
    Reconnect,
    /// The drain has run; the worker is done.
    Stopped,
}

/// One iteration's worth of event-loop input while idle.
enum Event {
    /// A control request, from a handle or a signal.
    Control(Control),
    /// A connection error posted by the `on_error` callback.
    Connection(ConnectionEvent),
    /// The next item of the delivery stream.
    Delivery(Option<std::result::Result<Delivery, lapin::Error>>),
}

/// How the consumer's verdict on a delivery is routed by the pipeline.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The consumer accepted the delivery.
    Accept,
    /// The consumer declined the delivery; it goes back on the queue.
    Requeue,
    /// The consumer declared the delivery unprocessable; it is dropped.
    Discard(String),
    /// The consumer panicked while processing.
    Unhandled(String),
}

impl From<Outcome> for Disposition {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Accept => Self::Accept,
            Outcome::Requeue => Self::Requeue,
            Outcome::Discard(reason) => Self::Discard(reason),
        }
    }
}

/// The broker response chosen for a settled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    /// Acknowledge the delivery.
    Ack,
    /// Reject the delivery, optionally putting it back on the queue.
    Nack {
        /// Whether the broker should requeue the message.
        requeue: bool,
    },
    /// Send nothing.
    Nothing,
}

/// Applies the disposition table for one settled delivery: records the
/// processing time, updates the counters and the error budget, and picks
/// the broker response.
///
/// `can_respond` is the anti-stale predicate: the channel that produced the
/// delivery tag must still be current. When it is false the broker response
/// is suppressed and `closed_on_complete` is counted instead, because the
/// tag would be meaningless (or worse, ambiguous) on a newer channel.
///
/// Returns the response to send and whether the error budget tripped.
pub(crate) fn settle(
    stats: &mut Stats,
    budget: &mut ErrorBudget,
    disposition: &Disposition,
    ack_enabled: bool,
    can_respond: bool,
    elapsed: Duration,
    now: Instant,
) -> (Response, bool) {
    stats.processing_time.add(elapsed);

    let response = match disposition {
        Disposition::Accept => {
            stats.counts.processed += 1;
            if ack_enabled {
                Response::Ack
            } else {
                Response::Nothing
            }
        }
        Disposition::Requeue | Disposition::Unhandled(_) => Response::Nack { requeue: true },
        Disposition::Discard(_) => Response::Nack { requeue: false },
    };

    if matches!(disposition, Disposition::Unhandled(_)) {
        stats.counts.unhandled_exceptions += 1;
    }

    let mut tripped = false;
    if !matches!(disposition, Disposition::Accept) {
        stats.counts.failed += 1;
        tripped = budget.record_failure(now);
    }

    let response = match response {
        Response::Nothing => Response::Nothing,
        Response::Nack { .. } if !ack_enabled => {
            // Nothing to reject: with no_ack the broker settled the
            // delivery the moment it was sent.
            error!("Consumer asked to reject a delivery but acknowledgements are disabled");
            Response::Nothing
        }
        _ if !can_respond => {
            warn!("Disconnected from the broker, suppressing the response");
            stats.counts.closed_on_complete += 1;
            Response::Nothing
        }
        Response::Ack => {
            stats.counts.acked += 1;
            Response::Ack
        }
        Response::Nack { requeue } => {
            if requeue {
                stats.counts.requeued += 1;
            } else {
                stats.counts.rejected += 1;
            }
            Response::Nack { requeue }
        }
    };

    (response, tripped)
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Injects stop and stats requests into a running worker, from the same
/// process. The handle produces the same events the worker's OS signals
/// map to.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Sender half of the worker's control queue.
    control: mpsc::UnboundedSender<Control>,
}

impl WorkerHandle {
    /// Requests a graceful stop. Idempotent; extra requests are logged and
    /// ignored by the worker.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Requests a stats snapshot, pushed to the worker's telemetry sink.
    pub fn request_stats(&self) {
        let _ = self.control.send(Control::ReportStats);
    }
}

/// A single-queue AMQP consumer worker.
///
/// The worker owns one broker connection and one channel, consumes exactly
/// one queue, and drives a [`Consumer`] one delivery at a time. It enforces
/// the lifecycle rules around the consumer: acknowledgements and
/// rejections, the stale-response guard across reconnects, the windowed
/// error budget, and the graceful drain on shutdown.
///
/// Run several workers, each in its own process, to consume queues in
/// parallel under an external supervisor.
#[must_use = "The worker will not consume anything unless you call `.run`."]
pub struct Worker {
    /// Immutable worker configuration.
    config: WorkerConfig,
    /// The broker address, with heartbeat, frame size and timeout applied.
    uri: AMQPUri,
    /// The lifecycle state machine.
    lifecycle: Lifecycle,
    /// Counters and timings.
    stats: Stats,
    /// Windowed failure accounting.
    budget: ErrorBudget,
    /// The consumer instance, owned for the worker's full lifetime.
    consumer: Box<dyn Consumer>,
    /// Capture endpoint for unhandled failures.
    sink: Box<dyn ErrorSink>,
    /// Write-only telemetry endpoint to the parent.
    telemetry: TelemetrySink,
    /// Connection epoch, incremented on every connect attempt.
    epoch: u64,
    /// The epoch captured when the in-flight delivery began processing.
    inflight_epoch: u64,
    /// The in-flight delivery, if any.
    message: Option<Arc<Message>>,
    /// The current broker connection.
    connection: Option<Connection>,
    /// The current channel.
    channel: Option<Channel>,
    /// Sender half of the connection event queue; cloned into `on_error`
    /// callbacks.
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Receiver half of the connection event queue.
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Sender half of the control queue; kept so the receiver never closes
    /// and so handles can be created at any time.
    control_tx: mpsc::UnboundedSender<Control>,
    /// Receiver half of the control queue.
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// OS signal streams; installed when the worker starts running.
    signals: Option<Signals>,
    /// When the most recent stats snapshot was pushed.
    last_stats_time: Option<Instant>,
}

impl Worker {
    /// Creates a worker from its configuration, building the consumer from
    /// the registry.
    ///
    /// # Errors
    /// Returns an error when the AMQP address does not parse or the
    /// consumer cannot be built. Both are fatal: the caller is expected to
    /// exit the process with a non-zero code so the supervisor notices.
    pub fn new(
        config: WorkerConfig,
        registry: &ConsumerRegistry,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        let mut uri: AMQPUri = config.amqp_addr.parse().map_err(Error::InvalidAddress)?;
        uri.query.heartbeat = Some(config.heartbeat);
        uri.query.connection_timeout = Some(WorkerConfig::CONNECTION_TIMEOUT_MS);
        if let Some(frame_max) = config.frame_max {
            uri.query.frame_max = Some(frame_max);
        }

        let mut consumer = registry.build(&config.consumer, config.consumer_config.as_ref())?;
        consumer.on_telemetry(telemetry.clone());

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let budget = ErrorBudget::new(config.max_errors, config.error_window);

        Ok(Self {
            uri,
            lifecycle: Lifecycle::new(),
            stats: Stats::new(),
            budget,
            consumer,
            sink: Box::new(NullSink),
            telemetry,
            epoch: 0,
            inflight_epoch: 0,
            message: None,
            connection: None,
            channel: None,
            conn_tx,
            conn_rx,
            control_tx,
            control_rx,
            signals: None,
            last_stats_time: None,
            config,
        })
    }

    /// Replaces the error sink unhandled failures are forwarded to.
    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Creates a handle for injecting stop and stats requests.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            control: self.control_tx.clone(),
        }
    }

    /// The worker's current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// The worker's lifetime counters.
    pub fn counters(&self) -> &crate::stats::Counters {
        &self.stats.counts
    }

    /// Runs the worker until it is gracefully stopped.
    ///
    /// Connection failures are not fatal: the worker retries forever with
    /// the configured reconnect delay. The future resolves only after a
    /// stop request has been drained.
    ///
    /// # Errors
    /// Returns an error when the signal handlers cannot be installed.
    pub async fn run(mut self) -> Result<()> {
        self.signals = Some(Signals::install()?);
        info!(
            worker = %self.config.worker_name,
            queue = %self.config.queue,
            consumer = %self.config.consumer,
            connection = %self.config.connection_name,
            "Starting worker"
        );
        loop {
            match self.session().await {
                Flow::Stopped => break,
                Flow::Reconnect => {
                    if let Flow::Stopped = self.reconnect_pause().await {
                        break;
                    }
                }
            }
        }
        debug!("Worker exiting");
        Ok(())
    }

    /// One connect attempt and, when it succeeds, one consume session on
    /// the resulting connection.
    async fn session(&mut self) -> Flow {
        self.lifecycle.set(WorkerState::Connecting);
        self.epoch += 1;
        debug!(epoch = self.epoch, "Connecting to the AMQP broker");

        let connection =
            match Connection::connect_uri(self.uri.clone(), ConnectionProperties::default()).await
            {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Failed to connect to the AMQP broker: {e}");
                    return Flow::Reconnect;
                }
            };

        // Connection errors are posted into the event loop rather than
        // handled in the callback; the epoch tag lets the loop discard
        // events from connections it has already abandoned.
        let conn_tx = self.conn_tx.clone();
        let epoch = self.epoch;
        connection.on_error(move |error| {
            let _ = conn_tx.send(ConnectionEvent { epoch, error });
        });

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open a channel: {e}");
                return Flow::Reconnect;
            }
        };
        let deliveries = match self.setup_channel(&channel).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!("Failed to set up the channel: {e}");
                return Flow::Reconnect;
            }
        };

        self.consumer.on_channel(channel.clone());
        self.connection = Some(connection);
        self.channel = Some(channel);
        self.budget.reset();
        self.lifecycle.set(WorkerState::Idle);
        info!(queue = %self.config.queue, "Consuming");

        self.consume(deliveries).await
    }

    /// Applies QoS, recovers undelivered messages and starts the consume.
    async fn setup_channel(&self, channel: &Channel) -> lapin::Result<lapin::Consumer> {
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        channel
            .basic_consume(
                &self.config.queue,
                &self.config.worker_name,
                BasicConsumeOptions {
                    no_ack: !self.config.ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
    }

    /// The idle half of the event loop: waits for deliveries and external
    /// events until the session ends.
    async fn consume(&mut self, mut deliveries: lapin::Consumer) -> Flow {
        loop {
            let event = tokio::select! {
                // Check from top to bottom, so control events are seen
                // before another delivery is started.
                biased;

                Some(control) = self.control_rx.recv() => Event::Control(control),
                signal = Self::next_signal(&mut self.signals) => Event::Control(signal.into()),
                Some(conn_event) = self.conn_rx.recv() => Event::Connection(conn_event),
                delivery = deliveries.next() => Event::Delivery(delivery),
            };

            match event {
                Event::Control(Control::ReportStats) => self.push_stats(),
                Event::Control(Control::Stop) => {
                    if let Some(flow) = self.stop().await {
                        return flow;
                    }
                }
                Event::Connection(conn_event) => {
                    if conn_event.epoch != self.epoch {
                        debug!(
                            epoch = conn_event.epoch,
                            "Discarding connection event from an abandoned connection"
                        );
                        continue;
                    }
                    error!(
                        state = %self.lifecycle.state(),
                        "Connection closed unexpectedly: {}",
                        conn_event.error
                    );
                    self.channel = None;
                    self.connection = None;
                    if self.lifecycle.is_running() {
                        return Flow::Reconnect;
                    }
                }
                Event::Delivery(Some(Ok(delivery))) => {
                    if let Some(flow) = self.on_delivery(delivery, &mut deliveries).await {
                        return flow;
                    }
                }
                Event::Delivery(Some(Err(e))) => {
                    error!("Channel closed unexpectedly: {e}");
                    self.channel = None;
                    if self.lifecycle.is_running() {
                        return Flow::Reconnect;
                    }
                }
                Event::Delivery(None) => {
                    if self.lifecycle.is_running() {
                        error!("Consumer was cancelled by the broker");
                        return Flow::Reconnect;
                    }
                    warn!("Delivery stream ended while stopping");
                    return Flow::Stopped;
                }
            }
        }
    }

    /// Entry point of the delivery pipeline.
    ///
    /// Returns the session's final flow when the delivery ended it (a
    /// drain after a deferred stop, a tripped error budget, or a lost
    /// connection); `None` means the worker is idle again. Deliveries the
    /// broker pushes while this one is still in flight are handled inside
    /// [`Worker::invoke`].
    async fn on_delivery(
        &mut self,
        delivery: Delivery,
        deliveries: &mut lapin::Consumer,
    ) -> Option<Flow> {
        let Some(channel) = self.channel.clone() else {
            // The channel vanished between the stream yielding and now.
            warn!("Dropping a delivery received without a channel");
            return None;
        };
        // The idle select only dispatches here while idle.
        debug_assert!(self.lifecycle.is_idle());

        self.stats.idle_time.add(self.lifecycle.since().elapsed());
        self.lifecycle.set(WorkerState::Processing);

        let message = Arc::new(Message::new(channel, delivery));
        if message.redelivered {
            self.stats.counts.redelivered += 1;
        }
        self.inflight_epoch = self.epoch;
        self.message = Some(Arc::clone(&message));

        let (disposition, lost_connection) = self.invoke(&message, deliveries).await;
        self.on_processed(&message, disposition, lost_connection).await
    }

    /// Awaits the consumer on the in-flight delivery.
    ///
    /// This is the pipeline's only suspension point: stop requests, stats
    /// requests, connection events and further deliveries are serviced
    /// here while the consumer runs. A stop defers shutdown until the
    /// consumer returns; a lost connection drops the channel (so the
    /// response will be suppressed) and flags the session for
    /// reconnection; an out-of-turn delivery is requeued on the spot.
    async fn invoke(
        &mut self,
        message: &Arc<Message>,
        deliveries: &mut lapin::Consumer,
    ) -> (Disposition, bool) {
        /// What the processing select woke up for.
        enum Wait {
            /// The consumer returned, or panicked.
            Done(std::result::Result<Outcome, Box<dyn Any + Send>>),
            /// A control request arrived mid-delivery.
            Control(Control),
            /// A connection event arrived mid-delivery.
            Connection(ConnectionEvent),
            /// The delivery stream produced something mid-delivery.
            Delivery(Option<std::result::Result<Delivery, lapin::Error>>),
        }

        let Self {
            consumer,
            signals,
            control_rx,
            conn_rx,
            channel,
            connection,
            lifecycle,
            stats,
            telemetry,
            config,
            last_stats_time,
            epoch,
            ..
        } = self;

        let call = AssertUnwindSafe(consumer.execute(message)).catch_unwind();
        tokio::pin!(call);

        let mut lost_connection = false;
        let mut stream_ended = false;
        loop {
            let wait = tokio::select! {
                biased;

                result = &mut call => Wait::Done(result),
                Some(control) = control_rx.recv() => Wait::Control(control),
                signal = Self::next_signal(signals) => Wait::Control(signal.into()),
                Some(conn_event) = conn_rx.recv() => Wait::Connection(conn_event),
                delivery = deliveries.next(), if !stream_ended => Wait::Delivery(delivery),
            };

            match wait {
                Wait::Done(Ok(outcome)) => return (outcome.into(), lost_connection),
                Wait::Done(Err(panic)) => {
                    let info = panic_message(panic.as_ref());
                    error!("Consumer panicked while processing: {info}");
                    return (Disposition::Unhandled(info), lost_connection);
                }
                Wait::Control(Control::ReportStats) => {
                    Self::push_stats_to(stats, lifecycle, telemetry, last_stats_time);
                }
                Wait::Control(Control::Stop) => {
                    if lifecycle.is_waiting_to_shutdown() {
                        warn!("Stop requested but the worker is already waiting to shut down");
                        continue;
                    }
                    info!("Stop requested, finishing the in-flight delivery first");
                    Self::cancel_consumer_on(channel.as_ref(), &config.worker_name).await;
                    lifecycle.set(WorkerState::StopRequested);
                }
                Wait::Connection(conn_event) => {
                    if conn_event.epoch != *epoch {
                        debug!(
                            epoch = conn_event.epoch,
                            "Discarding connection event from an abandoned connection"
                        );
                        continue;
                    }
                    error!(
                        "Connection closed while processing: {}",
                        conn_event.error
                    );
                    *channel = None;
                    *connection = None;
                    lost_connection = true;
                }
                Wait::Delivery(Some(Ok(delivery))) => {
                    Self::requeue_out_of_turn(
                        channel.as_ref(),
                        stats,
                        lifecycle,
                        delivery.delivery_tag,
                    )
                    .await;
                }
                Wait::Delivery(Some(Err(e))) => {
                    error!("Channel closed while processing: {e}");
                    *channel = None;
                    lost_connection = true;
                }
                Wait::Delivery(None) => {
                    // The consume was cancelled (a deferred stop does
                    // this); nothing more will arrive this session.
                    debug!("Delivery stream ended while processing");
                    stream_ended = true;
                }
            }
        }
    }

    /// Routes the consumer's verdict: broker response, counters, error
    /// budget, and the post-delivery state transition.
    async fn on_processed(
        &mut self,
        message: &Arc<Message>,
        disposition: Disposition,
        lost_connection: bool,
    ) -> Option<Flow> {
        // The in-flight record exists exactly while processing, or while a
        // deferred stop waits for processing to finish.
        debug_assert!(self.lifecycle.is_processing_or_stop_requested());
        debug_assert!(self.message.is_some());

        let elapsed = message.received_at.elapsed();
        match &disposition {
            Disposition::Accept => debug!(elapsed = ?elapsed, "Delivery processed"),
            Disposition::Requeue => debug!("Consumer declined the delivery, requeueing it"),
            Disposition::Discard(reason) => {
                warn!("Consumer discarded the delivery: {reason}");
            }
            Disposition::Unhandled(info) => {
                self.sink.capture(&ErrorReport {
                    logger: "warren.worker".to_string(),
                    versions: HashMap::from([(
                        "warren".to_string(),
                        env!("CARGO_PKG_VERSION").to_string(),
                    )]),
                    consumer: self.config.consumer.clone(),
                    connection: mask_uri_password(&self.config.amqp_addr),
                    environment: masked_environment(),
                    message: message.describe(),
                    error: info.clone(),
                    time_spent: elapsed,
                });
            }
        }

        let can_respond = self.channel.is_some() && self.inflight_epoch == self.epoch;
        let (response, tripped) = settle(
            &mut self.stats,
            &mut self.budget,
            &disposition,
            self.config.ack,
            can_respond,
            elapsed,
            Instant::now(),
        );
        self.respond(message, response).await;

        self.message = None;
        if self.lifecycle.is_waiting_to_shutdown() {
            // The deferred stop wins over everything else, including a
            // tripped budget; the connection is torn down in the drain.
            self.drain().await;
            return Some(Flow::Stopped);
        }
        self.lifecycle.set(WorkerState::Idle);

        if tripped {
            error!(
                errors = self.budget.count(),
                "Error threshold exceeded, reconnecting"
            );
            self.cancel_consumer().await;
            return Some(Flow::Reconnect);
        }
        if lost_connection {
            return Some(Flow::Reconnect);
        }
        None
    }

    /// Sends the chosen broker response for a settled delivery.
    async fn respond(&self, message: &Message, response: Response) {
        let Some(channel) = &self.channel else {
            // `settle` only picks a broker response while a channel exists.
            return;
        };
        match response {
            Response::Nothing => {}
            Response::Ack => {
                debug!(delivery_tag = message.delivery_tag, "Acking");
                if let Err(e) = channel
                    .basic_ack(message.delivery_tag, BasicAckOptions::default())
                    .await
                {
                    warn!("Failed to ack the delivery: {e}");
                }
            }
            Response::Nack { requeue } => {
                warn!(
                    delivery_tag = message.delivery_tag,
                    requeue, "Rejecting the delivery"
                );
                if let Err(e) = channel
                    .basic_nack(
                        message.delivery_tag,
                        BasicNackOptions {
                            requeue,
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!("Failed to reject the delivery: {e}");
                }
            }
        }
    }

    /// Begins a graceful stop.
    ///
    /// Returns the final flow when the worker can drain immediately; `None`
    /// when the stop was redundant. (A stop that arrives mid-delivery is
    /// handled inside [`Worker::invoke`] instead, which defers the drain
    /// until the consumer returns.)
    async fn stop(&mut self) -> Option<Flow> {
        if self.lifecycle.is_stopped() {
            warn!("Stop requested but the worker is already stopped");
            return None;
        }
        if self.lifecycle.is_shutting_down() {
            warn!("Stop requested but the worker is already shutting down");
            return None;
        }
        if self.lifecycle.is_waiting_to_shutdown() {
            warn!("Stop requested but the worker is already waiting to shut down");
            return None;
        }

        self.cancel_consumer().await;

        if self.lifecycle.is_processing() {
            info!("Waiting for the consumer to finish processing before shutting down");
            self.lifecycle.set(WorkerState::StopRequested);
            return None;
        }

        self.drain().await;
        Some(Flow::Stopped)
    }

    /// The terminal sequence: close the connection, run the consumer's
    /// shutdown hook, notify the parent and mark the worker stopped.
    ///
    /// Bounded by the configured `max_shutdown_wait`; an overrunning hook
    /// is abandoned and the worker exits anyway.
    async fn drain(&mut self) {
        self.lifecycle.set(WorkerState::ShuttingDown);
        if let Some(signals) = &mut self.signals {
            signals.disarm();
        }

        let bounded = tokio::time::timeout(self.config.max_shutdown_wait, async {
            if let Some(connection) = self.connection.take() {
                if connection.status().connected() {
                    debug!("Closing the connection");
                    if let Err(e) = connection.close(200, "worker shutting down").await {
                        warn!("Failed to close the connection cleanly: {e}");
                    }
                }
            }
            self.consumer.shutdown().await;
        })
        .await;
        if bounded.is_err() {
            warn!(
                "Shutdown did not finish within {:?}, exiting anyway",
                self.config.max_shutdown_wait
            );
        }

        self.channel = None;
        self.lifecycle.set(WorkerState::Stopped);
        if self
            .telemetry
            .send(Telemetry::Stopped {
                worker: self.config.worker_name.clone(),
            })
            .is_err()
        {
            debug!("Telemetry receiver is gone, dropping the stopped notification");
        }
        info!("Shutdown complete");
    }

    /// Drops the dead connection, counts the reconnect and sleeps the
    /// configured delay. Stop and stats requests are still served while
    /// waiting; a stop ends the pause (and the worker) immediately.
    async fn reconnect_pause(&mut self) -> Flow {
        self.channel = None;
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                debug!("Closing the abandoned connection");
                if let Err(e) = connection.close(200, "reconnecting").await {
                    debug!("Failed to close the abandoned connection: {e}");
                }
            }
        }
        self.stats.counts.reconnected += 1;
        self.budget.reset();
        if self.lifecycle.is_connecting() {
            // A failed attempt retries from scratch.
            self.lifecycle.set(WorkerState::Initializing);
        }
        info!(
            "Reconnecting to the AMQP broker in {:?}",
            self.config.reconnect_delay
        );

        let sleep = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);
        loop {
            let control = tokio::select! {
                biased;

                Some(control) = self.control_rx.recv() => Some(control),
                signal = Self::next_signal(&mut self.signals) => Some(signal.into()),
                () = &mut sleep => None,
            };
            match control {
                Some(Control::ReportStats) => self.push_stats(),
                Some(Control::Stop) => {
                    if let Some(flow) = self.stop().await {
                        return flow;
                    }
                }
                None => return Flow::Reconnect,
            }
        }
    }

    /// Waits for the next mapped OS signal; pends forever when signals are
    /// not installed or have been disarmed.
    async fn next_signal(signals: &mut Option<Signals>) -> SignalEvent {
        match signals {
            Some(signals) => signals.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Sends a basic-cancel for the worker's consumer tag, best effort.
    async fn cancel_consumer(&self) {
        Self::cancel_consumer_on(self.channel.as_ref(), &self.config.worker_name).await;
    }

    /// Requeues a delivery that arrived while another one is still in
    /// flight, which the broker may do whenever the prefetch allows more
    /// than one unacknowledged message.
    ///
    /// The newcomer is returned to the queue immediately; the in-flight
    /// delivery and the lifecycle state are untouched. Without a channel
    /// there is nothing to send and the broker will requeue the delivery
    /// itself once the dead connection is noticed.
    pub(crate) async fn requeue_out_of_turn(
        channel: Option<&Channel>,
        stats: &mut Stats,
        lifecycle: &Lifecycle,
        delivery_tag: u64,
    ) {
        error!(
            state = %lifecycle.state(),
            delivery_tag,
            "Received a delivery while not idle, requeueing it"
        );
        let Some(channel) = channel else {
            warn!("No channel to requeue the out-of-turn delivery on");
            return;
        };
        match channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(()) => stats.counts.requeued += 1,
            Err(e) => warn!("Failed to requeue the out-of-turn delivery: {e}"),
        }
    }

    /// [`Worker::cancel_consumer`], callable while the consumer future
    /// holds a borrow of the worker.
    async fn cancel_consumer_on(channel: Option<&Channel>, consumer_tag: &str) {
        let Some(channel) = channel else { return };
        if !channel.status().connected() {
            return;
        }
        debug!("Sending a basic-cancel to the broker");
        if let Err(e) = channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!("Failed to cancel the consumer: {e}");
        }
    }

    /// Produces a stats snapshot and pushes it to the telemetry sink.
    fn push_stats(&mut self) {
        Self::push_stats_to(
            &mut self.stats,
            &self.lifecycle,
            &self.telemetry,
            &mut self.last_stats_time,
        );
    }

    /// [`Worker::push_stats`], callable while the consumer future holds a
    /// borrow of the worker.
    fn push_stats_to(
        stats: &mut Stats,
        lifecycle: &Lifecycle,
        telemetry: &TelemetrySink,
        last_stats_time: &mut Option<Instant>,
    ) {
        if let Some(last) = *last_stats_time {
            debug!(interval = ?last.elapsed(), "Producing a stats report");
        }
        let report = stats.report(lifecycle.state(), lifecycle.since().elapsed());
        if telemetry.send(Telemetry::Stats(report)).is_err() {
            debug!("Telemetry receiver is gone, dropping the stats report");
        }
        *last_stats_time = Some(Instant::now());
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_name", &self.config.worker_name)
            .field("queue", &self.config.queue)
            .field("state", &self.lifecycle.state())
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
