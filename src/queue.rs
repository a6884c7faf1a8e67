use crate::consumer::{Consumer, ConsumerOptions};
use crate::{Channel, Exchange, FieldTable, Get, Result};

/// Options passed to the server when declaring a queue.
///
/// The [`default`](QueueDeclareOptions::default) implementation sets all
/// boolean fields to false and has an empty set of arguments.
#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOptions {
    /// If true, the queue survives server restarts (note that messages are
    /// only persistent if published with persistent delivery mode).
    pub durable: bool,

    /// If true, the queue belongs to this connection only and is deleted
    /// when the connection closes. Connection recovery re-declares
    /// exclusive queues (they died with the old connection).
    pub exclusive: bool,

    /// If true, the queue is deleted once its last consumer disconnects.
    pub auto_delete: bool,

    /// Extra arguments; optional in general, but may be needed for some
    /// plugins or server-specific features (e.g. message TTLs).
    pub arguments: FieldTable,
}

/// Options passed to the server when deleting a queue.
#[derive(Clone, Debug, Default)]
pub struct QueueDeleteOptions {
    /// Only delete if the queue has no consumers.
    pub if_unused: bool,

    /// Only delete if the queue is empty.
    pub if_empty: bool,
}

/// Handle for a declared queue.
pub struct Queue<'a> {
    channel: &'a Channel,
    name: String,
    message_count: Option<u32>,
    consumer_count: Option<u32>,
}

impl std::fmt::Debug for Queue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("message_count", &self.message_count)
            .field("consumer_count", &self.consumer_count)
            .finish()
    }
}

impl Queue<'_> {
    pub(crate) fn new(
        channel: &Channel,
        name: String,
        message_count: Option<u32>,
        consumer_count: Option<u32>,
    ) -> Queue<'_> {
        Queue {
            channel,
            name,
            message_count,
            consumer_count,
        }
    }

    /// The queue name; server-generated if the queue was declared with an
    /// empty name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Message count at declaration time.
    pub fn declared_message_count(&self) -> Option<u32> {
        self.message_count
    }

    /// Consumer count at declaration time.
    pub fn declared_consumer_count(&self) -> Option<u32> {
        self.consumer_count
    }

    /// Start a consumer on this queue.
    pub fn consume(&self, options: ConsumerOptions) -> Result<Consumer<'_>> {
        self.channel.basic_consume(self.name.clone(), options)
    }

    /// Synchronously fetch a single message; `None` if the queue is empty.
    pub fn get(&self, no_ack: bool) -> Result<Option<Get>> {
        self.channel.basic_get(self.name.clone(), no_ack)
    }

    /// Bind this queue to an exchange.
    pub fn bind<S: Into<String>>(
        &self,
        exchange: &Exchange<'_>,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_bind(self.name(), exchange.name(), routing_key, arguments)
    }

    /// Unbind this queue from an exchange.
    pub fn unbind<S: Into<String>>(
        &self,
        exchange: &Exchange<'_>,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_unbind(self.name(), exchange.name(), routing_key, arguments)
    }

    /// Remove all messages from the queue; returns the number removed.
    pub fn purge(&self) -> Result<u32> {
        self.channel.queue_purge(self.name())
    }

    /// Delete this queue; returns the number of messages it still held.
    pub fn delete(self, options: QueueDeleteOptions) -> Result<u32> {
        self.channel.queue_delete(self.name(), options)
    }
}
