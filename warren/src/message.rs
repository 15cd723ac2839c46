//! Captured AMQP deliveries.

use std::time::Instant;

use lapin::message::Delivery;
use lapin::{BasicProperties, Channel};
use serde_json::{json, Value};

/// One delivery, captured for the duration of its processing.
///
/// At most one `Message` exists per worker at a time. It carries the channel
/// the delivery arrived on, but consumers must not acknowledge or reject
/// through it; the worker settles every delivery itself, based on the
/// [`Outcome`](crate::Outcome) the consumer returns.
#[derive(Debug, Clone)]
pub struct Message {
    /// The channel the delivery arrived on.
    channel: Channel,
    /// Per-channel identifier of the delivery. Only meaningful on the
    /// channel that produced it.
    pub delivery_tag: u64,
    /// The exchange the message was published to.
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// The AMQP properties of the message.
    pub properties: BasicProperties,
    /// The raw message payload.
    pub body: Vec<u8>,
    /// True if the broker has delivered this message to some consumer
    /// before.
    pub redelivered: bool,
    /// When the worker received the delivery.
    pub received_at: Instant,
}

impl Message {
    /// Captures a delivery from the given channel.
    pub(crate) fn new(channel: Channel, delivery: Delivery) -> Self {
        Self {
            channel,
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            properties: delivery.properties,
            body: delivery.data,
            redelivered: delivery.redelivered,
            received_at: Instant::now(),
        }
    }

    /// The channel the delivery arrived on.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Renders the delivery as a structured record for error reports.
    ///
    /// The body is included lossily as UTF-8; binary payloads come through
    /// with replacement characters rather than not at all.
    pub fn describe(&self) -> Value {
        json!({
            "exchange": self.exchange,
            "routing_key": self.routing_key,
            "delivery_tag": self.delivery_tag,
            "redelivered": self.redelivered,
            "content_type": self.properties.content_type().as_ref().map(|v| v.as_str()),
            "app_id": self.properties.app_id().as_ref().map(|v| v.as_str()),
            "body": String::from_utf8_lossy(&self.body),
        })
    }
}
