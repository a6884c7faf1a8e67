use crate::{Channel, Delivery, Result};

/// A message fetched with a synchronous [`Queue::get`](crate::Queue::get)
/// request.
#[derive(Clone, Debug)]
pub struct Get {
    /// The message.
    pub delivery: Delivery,

    /// The number of messages remaining in the queue when the get was
    /// serviced.
    pub message_count: u32,
}

impl Get {
    /// Acknowledge the fetched message.
    #[inline]
    pub fn ack(self, channel: &Channel) -> Result<()> {
        self.delivery.ack(channel, false)
    }

    /// Reject the fetched message, optionally requeueing it.
    #[inline]
    pub fn nack(self, channel: &Channel, requeue: bool) -> Result<()> {
        self.delivery.nack(channel, false, requeue)
    }
}
