use crate::wire::method::basic::Return as AmqpReturn;
use crate::AmqpProperties;

/// A published message bounced back by the server because it could not be
/// routed (`mandatory` was set and no queue matched). Returned messages are
/// delivered to return listeners registered on the channel; a return never
/// negates a publisher confirm for the same message.
#[derive(Clone, Debug)]
pub struct Return {
    /// AMQP reply code explaining the return (typically 312 NO_ROUTE).
    pub reply_code: u16,

    /// Human-readable counterpart of `reply_code`.
    pub reply_text: String,

    /// The exchange the message was published to.
    pub exchange: String,

    /// The routing key the message was published with.
    pub routing_key: String,

    /// The message body.
    pub content: Vec<u8>,

    /// Properties attached by the publisher.
    pub properties: AmqpProperties,
}

impl Return {
    pub(crate) fn new(ret: AmqpReturn, content: Vec<u8>, properties: AmqpProperties) -> Return {
        Return {
            reply_code: ret.reply_code,
            reply_text: ret.reply_text,
            exchange: ret.exchange,
            routing_key: ret.routing_key,
            content,
            properties,
        }
    }
}
