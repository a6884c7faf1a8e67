use crate::confirm::ConfirmHandle;
use crate::{AmqpProperties, Channel, FieldTable, Result};

/// Types of AMQP exchanges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeType {
    /// Direct exchange; delivers messages to queues based on the routing
    /// key.
    Direct,

    /// Fanout exchange; delivers messages to all bound queues and ignores
    /// routing key.
    Fanout,

    /// Topic exchange; delivers messages based on matching between a
    /// message routing key and the pattern that was used to bind a queue
    /// to an exchange.
    Topic,

    /// Headers exchange; ignores routing key and routes based on message
    /// header fields.
    Headers,

    /// Custom exchange type; should begin with "x-".
    Custom(String),
}

impl AsRef<str> for ExchangeType {
    fn as_ref(&self) -> &str {
        use self::ExchangeType::*;
        match self {
            Direct => "direct",
            Fanout => "fanout",
            Topic => "topic",
            Headers => "headers",
            Custom(s) => s,
        }
    }
}

/// Options passed to the server when declaring an exchange.
///
/// The [`default`](ExchangeDeclareOptions::default) implementation sets all
/// boolean fields to false and has an empty set of arguments.
#[derive(Clone, Debug, Default)]
pub struct ExchangeDeclareOptions {
    /// If true, the exchange survives server restarts.
    pub durable: bool,

    /// If true, the exchange is deleted once no queues are bound to it.
    pub auto_delete: bool,

    /// If true, the exchange may not be used by publishers, only for
    /// exchange-to-exchange bindings.
    pub internal: bool,

    /// Extra arguments; optional in general, but may be needed for some
    /// plugins or server-specific features.
    pub arguments: FieldTable,
}

/// Handle for a declared exchange.
pub struct Exchange<'a> {
    channel: &'a Channel,
    name: String,
}

impl Exchange<'_> {
    pub(crate) fn new(channel: &Channel, name: String) -> Exchange<'_> {
        Exchange { channel, name }
    }

    /// The default (nameless) direct exchange; every queue is bound to it
    /// by its own name.
    pub fn direct(channel: &Channel) -> Exchange<'_> {
        Exchange::new(channel, String::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish to this exchange. In confirm mode, returns a handle
    /// resolving when the server acks or nacks.
    pub fn publish<T: AsRef<[u8]>, S: Into<String>>(
        &self,
        content: T,
        routing_key: S,
        mandatory: bool,
        properties: &AmqpProperties,
    ) -> Result<Option<ConfirmHandle>> {
        self.channel
            .basic_publish(content, self.name(), routing_key, mandatory, properties)
    }

    /// Bind this exchange (as destination) to `source`, for
    /// exchange-to-exchange routing.
    pub fn bind_to_source<S: Into<String>>(
        &self,
        source: &Exchange<'_>,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_bind(self.name(), source.name(), routing_key, arguments)
    }

    /// Unbind this exchange (as destination) from `source`.
    pub fn unbind_from_source<S: Into<String>>(
        &self,
        source: &Exchange<'_>,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_unbind(self.name(), source.name(), routing_key, arguments)
    }

    /// Delete this exchange.
    pub fn delete(self, if_unused: bool) -> Result<()> {
        self.channel.exchange_delete(self.name(), if_unused)
    }
}
