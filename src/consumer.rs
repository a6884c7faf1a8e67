use crate::errors::*;
use crate::io_loop::Acker;
use crate::{Channel, Delivery, FieldTable};
use crossbeam_channel::Receiver;
use log::error;
use std::cell::Cell;
use std::sync::Mutex;

/// Options passed to the server when starting a consumer.
///
/// The [`default`](ConsumerOptions::default) implementation sets all
/// boolean fields to false and has an empty set of arguments.
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// If true, the server will not send this consumer messages that were
    /// published by this consumer's connection.
    pub no_local: bool,

    /// If true, the server assumes all delivered messages are acknowledged
    /// and the client should not ack messages.
    pub no_ack: bool,

    /// If true, requires that this consumer is the only one attached to
    /// the queue. If other consumers are active, the server closes the
    /// channel.
    pub exclusive: bool,

    /// Extra arguments; optional in general, but may be needed for some
    /// plugins or server-specific features (e.g. consumer priorities).
    pub arguments: FieldTable,
}

/// Messages delivered to consumers.
// Clippy warns about ConsumerMessage::Delivery being much larger than the
// other variants, but we expect almost all instances to be Deliveries.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum ConsumerMessage {
    /// A delivered message.
    Delivery(Delivery),

    /// The consumer was cancelled by the client.
    ClientCancelled,

    /// The consumer was cancelled by the server; e.g., because its queue
    /// was deleted.
    ServerCancelled,

    /// The client closed the channel this consumer lives on.
    ClientClosedChannel,

    /// The server closed the channel this consumer lives on.
    ServerClosedChannel(Error),

    /// The client closed the connection.
    ClientClosedConnection,

    /// The server closed the connection (and recovery, if enabled, gave
    /// up).
    ServerClosedConnection(Error),
}

/// A message consumer attached to an AMQP queue.
///
/// Deliveries arrive on [`receiver`](Consumer::receiver) - a plain stream
/// that can be drained from any thread - or via
/// [`dispatch`](Consumer::dispatch), which runs a bounded pool of worker
/// threads invoking a callback.
pub struct Consumer<'a> {
    channel: &'a Channel,
    consumer_tag: String,
    rx: Receiver<ConsumerMessage>,
    cancelled: Cell<bool>,
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}

impl Consumer<'_> {
    pub(crate) fn new(
        channel: &Channel,
        consumer_tag: String,
        rx: Receiver<ConsumerMessage>,
    ) -> Consumer<'_> {
        Consumer {
            channel,
            consumer_tag,
            rx,
            cancelled: Cell::new(false),
        }
    }

    /// The consumer tag identifying this consumer on its channel. The tag
    /// is preserved across connection recovery even when it was generated
    /// by the server.
    #[inline]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The receiver on which messages are delivered. After any variant
    /// other than [`ConsumerMessage::Delivery`] the stream is finished and
    /// the sending side is dropped.
    #[inline]
    pub fn receiver(&self) -> &Receiver<ConsumerMessage> {
        &self.rx
    }

    /// Cancel this consumer. When the cancellation is acknowledged, the
    /// receiver yields [`ConsumerMessage::ClientCancelled`]. This method
    /// does not consume `self` because cancellation is inherently racy;
    /// the server may still be sending deliveries while we cancel.
    ///
    /// Calling this a second or later time always returns `Ok`; capture
    /// the first call's `Err` if you care about cancellation errors.
    pub fn cancel(&self) -> Result<()> {
        if self.cancelled.get() {
            return Ok(());
        }
        self.cancelled.set(true);
        self.channel.basic_cancel(&self.consumer_tag)
    }

    /// Ack `delivery` on this consumer's channel.
    #[inline]
    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        delivery.ack(self.channel, false)
    }

    /// Nack `delivery` on this consumer's channel.
    #[inline]
    pub fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        delivery.nack(self.channel, false, requeue)
    }

    /// Drain this consumer with a pool of worker threads.
    ///
    /// `concurrency` worker threads (the connection's configured default
    /// when 0) pull deliveries off the consumer's queue and invoke
    /// `handler`. With one worker, per-channel delivery order is
    /// preserved; with more, ordering is explicitly not guaranteed and the
    /// handler runs concurrently from multiple threads.
    ///
    /// Blocks until the consumer is cancelled or its channel/connection
    /// closes. In-flight handlers run to completion on close, but their
    /// acks fail with a channel-closed error. A handler that panics is
    /// logged and its worker keeps running; panics do not poison the
    /// dispatcher.
    pub fn dispatch<H>(&self, handler: H, concurrency: usize) -> Result<()>
    where
        H: Fn(&Acker, Delivery) + Send + Sync,
    {
        let concurrency = if concurrency == 0 {
            self.channel.default_dispatch_concurrency()
        } else {
            concurrency
        };
        let acker = self.channel.acker()?;
        let terminal: Mutex<Option<Error>> = Mutex::new(None);
        let handler = &handler;

        std::thread::scope(|scope| {
            for _ in 0..concurrency {
                let worker_acker = acker.clone();
                let rx = self.rx.clone();
                let terminal = &terminal;
                scope.spawn(move || {
                    for message in rx.iter() {
                        match message {
                            ConsumerMessage::Delivery(delivery) => {
                                let caught = std::panic::catch_unwind(
                                    std::panic::AssertUnwindSafe(|| {
                                        handler(&worker_acker, delivery)
                                    }),
                                );
                                if caught.is_err() {
                                    error!("consumer callback panicked; continuing");
                                }
                            }
                            ConsumerMessage::ServerClosedChannel(err)
                            | ConsumerMessage::ServerClosedConnection(err) => {
                                terminal.lock().unwrap().get_or_insert(err);
                                break;
                            }
                            ConsumerMessage::ClientCancelled
                            | ConsumerMessage::ServerCancelled
                            | ConsumerMessage::ClientClosedChannel
                            | ConsumerMessage::ClientClosedConnection => break,
                        }
                    }
                });
            }
        });

        match terminal.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
