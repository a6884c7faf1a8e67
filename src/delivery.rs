use crate::wire::method::basic::{Deliver, GetOk};
use crate::{AmqpProperties, Channel, Result};

/// A message delivered to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    delivery_tag: u64,

    /// True if this message was previously delivered and requeued.
    pub redelivered: bool,

    /// The exchange it was published to.
    pub exchange: String,

    /// The routing key it was published with.
    pub routing_key: String,

    /// The message body.
    pub content: Vec<u8>,

    /// Properties attached by the publisher.
    pub properties: AmqpProperties,
}

impl Delivery {
    pub(crate) fn new(
        deliver: Deliver,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> (String, Delivery) {
        (
            deliver.consumer_tag,
            Delivery {
                delivery_tag: deliver.delivery_tag,
                redelivered: deliver.redelivered,
                exchange: deliver.exchange,
                routing_key: deliver.routing_key,
                content,
                properties,
            },
        )
    }

    pub(crate) fn new_get_ok(
        get_ok: GetOk,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> Delivery {
        Delivery {
            delivery_tag: get_ok.delivery_tag,
            redelivered: get_ok.redelivered,
            exchange: get_ok.exchange,
            routing_key: get_ok.routing_key,
            content,
            properties,
        }
    }

    /// The server-assigned delivery tag, scoped to the channel the message
    /// arrived on. Take care not to ack deliveries across channels: tags
    /// are only meaningful on their own channel.
    #[inline]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge this message (and all earlier unacked deliveries on the
    /// channel if `multiple`).
    #[inline]
    pub fn ack(&self, channel: &Channel, multiple: bool) -> Result<()> {
        channel.basic_ack(self, multiple)
    }

    /// Reject this message, asking the server to requeue it or discard it.
    #[inline]
    pub fn nack(&self, channel: &Channel, multiple: bool, requeue: bool) -> Result<()> {
        channel.basic_nack(self, multiple, requeue)
    }

    /// Like [`nack`](Delivery::nack) without the `multiple` option.
    #[inline]
    pub fn reject(&self, channel: &Channel, requeue: bool) -> Result<()> {
        channel.basic_reject(self, requeue)
    }
}
