use crate::cancellation::Cancellation;
use crate::confirm::{Confirm, ConfirmHandle};
use crate::connection::ConnectionInner;
use crate::consumer::{Consumer, ConsumerMessage, ConsumerOptions};
use crate::errors::*;
use crate::exchange::{Exchange, ExchangeDeclareOptions, ExchangeType};
use crate::io_loop::{Acker, ChannelHandle};
use crate::queue::{Queue, QueueDeclareOptions, QueueDeleteOptions};
use crate::topology::{RecordedBinding, RecordedExchange, RecordedQueue};
use crate::wire::method::basic;
use crate::wire::method::exchange as exchange_method;
use crate::wire::method::queue as queue_method;
use crate::wire::{AmqpProperties, FieldTable};
use crate::{Delivery, Get, Return};
use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Everything needed to re-establish one consumer after recovery.
pub(crate) struct RecordedConsumer {
    pub(crate) queue: String,
    pub(crate) no_local: bool,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: FieldTable,
    pub(crate) sink: Sender<ConsumerMessage>,
}

pub(crate) enum Phase {
    Open(ChannelHandle),
    Recovering,
    Closed(Error),
}

pub(crate) struct CoreState {
    pub(crate) phase: Phase,
    pub(crate) generation: u64,
    pub(crate) confirms_enabled: bool,
    pub(crate) qos: Option<basic::Qos>,
    pub(crate) consumers: IndexMap<String, RecordedConsumer>,
    pub(crate) return_handler: Option<Sender<Return>>,
    pub(crate) confirm_handler: Option<Sender<Confirm>>,
    cancellation: Option<Cancellation>,
}

/// The rebindable interior of a [`Channel`]. During recovery the
/// supervisor swaps in a fresh [`ChannelHandle`] (with a possibly
/// different channel id) and bumps the generation; operations caught
/// mid-failure wait for the swap instead of surfacing transport errors.
pub(crate) struct ChannelCore {
    state: Mutex<CoreState>,
    cond: Condvar,

    // Upper bound on how long an operation waits for a rebind before
    // giving up with the original error.
    rebind_wait: Duration,
}

impl ChannelCore {
    pub(crate) fn new(handle: ChannelHandle, rebind_wait: Duration) -> ChannelCore {
        ChannelCore {
            state: Mutex::new(CoreState {
                phase: Phase::Open(handle),
                generation: 0,
                confirms_enabled: false,
                qos: None,
                consumers: IndexMap::new(),
                return_handler: None,
                confirm_handler: None,
                cancellation: None,
            }),
            cond: Condvar::new(),
            rebind_wait,
        }
    }

    /// Called by the recovery supervisor: channel enters limbo while the
    /// transport is re-established.
    pub(crate) fn mark_recovering(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.phase, Phase::Open(_)) {
            state.phase = Phase::Recovering;
        }
        self.cond.notify_all();
    }

    pub(crate) fn is_recovering(&self) -> bool {
        matches!(self.state.lock().unwrap().phase, Phase::Recovering)
    }

    /// Called by the recovery supervisor once a replacement handle exists
    /// (or with `Err` when recovery was abandoned).
    pub(crate) fn rebind(&self, result: Result<ChannelHandle>) {
        let mut state = self.state.lock().unwrap();
        state.phase = match result {
            Ok(handle) => Phase::Open(handle),
            Err(err) => Phase::Closed(err),
        };
        state.generation += 1;
        self.cond.notify_all();
    }

    /// Terminally close the channel object.
    pub(crate) fn fail(&self, err: Error) {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.phase, Phase::Closed(_)) {
            state.phase = Phase::Closed(err);
        }
        state.generation += 1;
        // dropping the handler senders ends any listener streams
        state.return_handler = None;
        state.confirm_handler = None;
        self.cond.notify_all();
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap()
    }

    /// Wait until the channel is usable (Open) or terminal (Closed),
    /// riding out any in-progress recovery.
    fn lock_open(&self) -> Result<MutexGuard<'_, CoreState>> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &state.phase {
                Phase::Open(_) => return Ok(state),
                Phase::Closed(err) => return Err(err.clone()),
                Phase::Recovering => state = self.cond.wait(state).unwrap(),
            }
        }
    }

    /// Wait (bounded) for the generation to move past `seen`; true if it
    /// did, false on timeout.
    fn await_rebind(&self, seen: u64) -> bool {
        let deadline = Instant::now() + self.rebind_wait;
        let mut state = self.state.lock().unwrap();
        while state.generation == seen {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return false,
            };
            let (guard, _) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
        true
    }
}

// Errors meaning "the I/O thread is gone" - if recovery is running (or
// about to run), the operation should wait for a rebind and retry rather
// than surface these.
fn io_loop_gone(err: &Error) -> bool {
    matches!(err, Error::EventLoopDropped | Error::EventLoopClientDropped)
}

/// A single AMQP channel multiplexed over its connection.
///
/// All methods take `&self`; an internal lock serializes RPCs so at most
/// one continuation is outstanding at a time. A channel closed by a soft
/// server error (e.g. 406 PRECONDITION_FAILED) is permanently closed;
/// open a new one from the [`Connection`](crate::Connection).
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
    pub(crate) conn: Arc<ConnectionInner>,
    closed_by_user: AtomicBool,
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed_by_user.load(Ordering::SeqCst) {
            let _ = self.close_impl();
        }
    }
}

impl Channel {
    pub(crate) fn new(core: Arc<ChannelCore>, conn: Arc<ConnectionInner>) -> Channel {
        Channel {
            core,
            conn,
            closed_by_user: AtomicBool::new(false),
        }
    }

    /// The current channel id. May change if the connection recovers from
    /// a transport failure.
    pub fn channel_id(&self) -> Result<u16> {
        self.with_state(|state| Ok(Self::handle_of(state).channel_id()))
    }

    /// Attach a cancellation handle consulted by every blocking operation
    /// on this channel; pass `None` to detach.
    pub fn set_cancellation(&self, cancellation: Option<Cancellation>) {
        self.core.lock().cancellation = cancellation;
    }

    /// Close the channel with an orderly close handshake.
    pub fn close(self) -> Result<()> {
        self.closed_by_user.store(true, Ordering::SeqCst);
        self.close_impl()
    }

    fn close_impl(&self) -> Result<()> {
        let mut state = self.core.lock();
        let result = match &mut state.phase {
            Phase::Open(handle) => handle.close(),
            // mid-recovery or already closed; nothing to say to the server
            Phase::Recovering | Phase::Closed(_) => Ok(()),
        };
        // Mark the channel closed even if close() failed; the caller
        // cannot retry (close consumed self) and this keeps Drop from
        // trying again.
        state.phase = Phase::Closed(ClientClosedChannelSnafu.build());
        state.generation += 1;
        state.consumers.clear();
        state.return_handler = None;
        state.confirm_handler = None;
        self.core.cond.notify_all();
        result
    }

    /// Run `f` against the open channel state, waiting out recovery and
    /// retrying when the I/O thread evaporated underneath us.
    fn with_state<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut CoreState) -> Result<T>,
    {
        loop {
            let (result, generation) = {
                let mut state = self.core.lock_open()?;
                let generation = state.generation;
                (f(&mut state), generation)
            };
            match result {
                Err(err) if io_loop_gone(&err) => {
                    // the connection may be recovering; wait for our core
                    // to be rebound, then retry
                    if self.core.await_rebind(generation) {
                        continue;
                    }
                    return Err(err);
                }
                Err(err @ Error::ServerClosedChannel { .. }) => {
                    // soft error: this channel object is terminal
                    self.core.fail(err.clone());
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    fn handle_of(state: &mut CoreState) -> &mut ChannelHandle {
        match &mut state.phase {
            Phase::Open(handle) => handle,
            _ => unreachable!("with_state only runs on open channels"),
        }
    }

    // ---- declarations -------------------------------------------------

    /// Declare a queue. An empty name asks the server to generate one.
    pub fn queue_declare<S: Into<String>>(
        &self,
        queue: S,
        options: QueueDeclareOptions,
    ) -> Result<Queue> {
        let queue = queue.into();
        let server_named = queue.is_empty();
        let declare_ok = self.queue_declare_inner(queue, options.clone(), false)?;
        self.conn.topology().record_queue(RecordedQueue {
            name: declare_ok.queue.clone(),
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            server_named,
            arguments: options.arguments,
        });
        Ok(Queue::new(
            self,
            declare_ok.queue,
            Some(declare_ok.message_count),
            Some(declare_ok.consumer_count),
        ))
    }

    /// Passively check that a queue exists; does not record topology.
    pub fn queue_declare_passive<S: Into<String>>(&self, queue: S) -> Result<Queue> {
        let declare_ok =
            self.queue_declare_inner(queue.into(), QueueDeclareOptions::default(), true)?;
        Ok(Queue::new(
            self,
            declare_ok.queue,
            Some(declare_ok.message_count),
            Some(declare_ok.consumer_count),
        ))
    }

    fn queue_declare_inner(
        &self,
        queue: String,
        options: QueueDeclareOptions,
        passive: bool,
    ) -> Result<queue_method::DeclareOk> {
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            Self::handle_of(state).queue_declare(
                queue_method::Declare {
                    ticket: 0,
                    queue: queue.clone(),
                    passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                    arguments: options.arguments.clone(),
                },
                cancellation.as_ref(),
            )
        })
    }

    /// Declare an exchange of the given type.
    pub fn exchange_declare<S: Into<String>>(
        &self,
        type_: ExchangeType,
        name: S,
        options: ExchangeDeclareOptions,
    ) -> Result<Exchange> {
        let name = name.into();
        self.exchange_declare_inner(
            type_.as_ref().to_string(),
            name.clone(),
            options.clone(),
            false,
        )?;
        self.conn.topology().record_exchange(RecordedExchange {
            name: name.clone(),
            type_: type_.as_ref().to_string(),
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            arguments: options.arguments,
        });
        Ok(Exchange::new(self, name))
    }

    /// Passively check that an exchange exists; does not record topology.
    pub fn exchange_declare_passive<S: Into<String>>(&self, name: S) -> Result<Exchange> {
        let name = name.into();
        self.exchange_declare_inner(
            ExchangeType::Direct.as_ref().to_string(),
            name.clone(),
            ExchangeDeclareOptions::default(),
            true,
        )?;
        Ok(Exchange::new(self, name))
    }

    fn exchange_declare_inner(
        &self,
        type_: String,
        name: String,
        options: ExchangeDeclareOptions,
        passive: bool,
    ) -> Result<()> {
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let _ok: exchange_method::DeclareOk = Self::handle_of(state).exchange_declare(
                exchange_method::Declare {
                    ticket: 0,
                    exchange: name.clone(),
                    type_: type_.clone(),
                    passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                    arguments: options.arguments.clone(),
                },
                cancellation.as_ref(),
            )?;
            Ok(())
        })
    }

    // ---- bindings -----------------------------------------------------

    pub fn queue_bind<S0, S1, S2>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()>
    where
        S0: Into<String>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let (queue, exchange, routing_key) = (queue.into(), exchange.into(), routing_key.into());
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let _ok: queue_method::BindOk = Self::handle_of(state).call(
                queue_method::Method::Bind(queue_method::Bind {
                    ticket: 0,
                    queue: queue.clone(),
                    exchange: exchange.clone(),
                    routing_key: routing_key.clone(),
                    nowait: false,
                    arguments: arguments.clone(),
                }),
                cancellation.as_ref(),
            )?;
            Ok(())
        })?;
        self.conn.topology().record_queue_binding(RecordedBinding {
            destination: queue,
            source: exchange,
            routing_key,
            arguments,
        });
        Ok(())
    }

    pub fn queue_unbind<S0, S1, S2>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()>
    where
        S0: Into<String>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let (queue, exchange, routing_key) = (queue.into(), exchange.into(), routing_key.into());
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let _ok: queue_method::UnbindOk = Self::handle_of(state).call(
                queue_method::Method::Unbind(queue_method::Unbind {
                    ticket: 0,
                    queue: queue.clone(),
                    exchange: exchange.clone(),
                    routing_key: routing_key.clone(),
                    arguments: arguments.clone(),
                }),
                cancellation.as_ref(),
            )?;
            Ok(())
        })?;
        self.conn.topology().forget_queue_binding(&RecordedBinding {
            destination: queue,
            source: exchange,
            routing_key,
            arguments,
        });
        Ok(())
    }

    pub fn exchange_bind<S0, S1, S2>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()>
    where
        S0: Into<String>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let (destination, source, routing_key) =
            (destination.into(), source.into(), routing_key.into());
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let _ok: exchange_method::BindOk = Self::handle_of(state).call(
                exchange_method::Method::Bind(exchange_method::Bind {
                    ticket: 0,
                    destination: destination.clone(),
                    source: source.clone(),
                    routing_key: routing_key.clone(),
                    nowait: false,
                    arguments: arguments.clone(),
                }),
                cancellation.as_ref(),
            )?;
            Ok(())
        })?;
        self.conn
            .topology()
            .record_exchange_binding(RecordedBinding {
                destination,
                source,
                routing_key,
                arguments,
            });
        Ok(())
    }

    pub fn exchange_unbind<S0, S1, S2>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()>
    where
        S0: Into<String>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let (destination, source, routing_key) =
            (destination.into(), source.into(), routing_key.into());
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let _ok: exchange_method::UnbindOk = Self::handle_of(state).call(
                exchange_method::Method::Unbind(exchange_method::Unbind {
                    ticket: 0,
                    destination: destination.clone(),
                    source: source.clone(),
                    routing_key: routing_key.clone(),
                    nowait: false,
                    arguments: arguments.clone(),
                }),
                cancellation.as_ref(),
            )?;
            Ok(())
        })?;
        self.conn
            .topology()
            .forget_exchange_binding(&RecordedBinding {
                destination,
                source,
                routing_key,
                arguments,
            });
        Ok(())
    }

    // ---- deletion -----------------------------------------------------

    /// Purge a queue; returns the number of messages removed.
    pub fn queue_purge<S: Into<String>>(&self, queue: S) -> Result<u32> {
        let queue = queue.into();
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let purge_ok: queue_method::PurgeOk = Self::handle_of(state).call(
                queue_method::Method::Purge(queue_method::Purge {
                    ticket: 0,
                    queue: queue.clone(),
                    nowait: false,
                }),
                cancellation.as_ref(),
            )?;
            Ok(purge_ok.message_count)
        })
    }

    /// Delete a queue; returns the number of messages it still held.
    pub fn queue_delete<S: Into<String>>(
        &self,
        queue: S,
        options: QueueDeleteOptions,
    ) -> Result<u32> {
        let queue = queue.into();
        let count = self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let delete_ok: queue_method::DeleteOk = Self::handle_of(state).call(
                queue_method::Method::Delete(queue_method::Delete {
                    ticket: 0,
                    queue: queue.clone(),
                    if_unused: options.if_unused,
                    if_empty: options.if_empty,
                    nowait: false,
                }),
                cancellation.as_ref(),
            )?;
            Ok(delete_ok.message_count)
        })?;
        self.conn.topology().forget_queue(&queue);
        Ok(count)
    }

    pub fn exchange_delete<S: Into<String>>(&self, exchange: S, if_unused: bool) -> Result<()> {
        let exchange = exchange.into();
        self.with_state(|state| {
            let cancellation = state.cancellation.clone();
            let _ok: exchange_method::DeleteOk = Self::handle_of(state).call(
                exchange_method::Method::Delete(exchange_method::Delete {
                    ticket: 0,
                    exchange: exchange.clone(),
                    if_unused,
                    nowait: false,
                }),
                cancellation.as_ref(),
            )?;
            Ok(())
        })?;
        self.conn.topology().forget_exchange(&exchange);
        Ok(())
    }

    // ---- publishing ---------------------------------------------------

    /// Publish a message. In confirm mode, returns a handle resolving when
    /// the server acks or nacks; otherwise returns `None`.
    ///
    /// Confirm sequences follow wire order: they are assigned by the
    /// connection's I/O thread as the frames enter the write buffer, not
    /// here.
    pub fn basic_publish<T, S0, S1>(
        &self,
        content: T,
        exchange: S0,
        routing_key: S1,
        mandatory: bool,
        properties: &AmqpProperties,
    ) -> Result<Option<ConfirmHandle>>
    where
        T: AsRef<[u8]>,
        S0: Into<String>,
        S1: Into<String>,
    {
        let (exchange, routing_key) = (exchange.into(), routing_key.into());
        self.with_state(|state| {
            let publish = basic::Publish {
                ticket: 0,
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
                mandatory,
                // immediate was deprecated by RabbitMQ; modern brokers
                // close the connection if it is set
                immediate: false,
            };
            let (cell, handle) = if state.confirms_enabled {
                let (cell, handle) = ConfirmHandle::new();
                (Some(cell), Some(handle))
            } else {
                (None, None)
            };
            Self::handle_of(state).publish(publish, content.as_ref(), properties, cell)?;
            Ok(handle)
        })
    }

    /// Put this channel into publisher-confirm mode. Irreversible for the
    /// life of the channel; survives recovery.
    pub fn enable_publisher_confirms(&self) -> Result<()> {
        self.with_state(|state| {
            if state.confirms_enabled {
                return Ok(());
            }
            Self::handle_of(state).confirm_select()?;
            state.confirms_enabled = true;
            Ok(())
        })
    }

    /// Register a listener for raw publisher confirms (ack/nack events
    /// exactly as the server sends them; cumulative confirms are not
    /// expanded - feed them through a
    /// [`ConfirmSmoother`](crate::ConfirmSmoother) for per-tag events).
    /// Replaces any previously registered listener.
    pub fn listen_for_publisher_confirms(&self) -> Result<Receiver<Confirm>> {
        self.with_state(|state| {
            let (tx, rx) = crossbeam_channel::unbounded();
            Self::handle_of(state).set_confirm_handler(Some(tx.clone()))?;
            state.confirm_handler = Some(tx);
            Ok(rx)
        })
    }

    /// Register a listener for returned (unroutable mandatory) messages.
    /// Replaces any previously registered listener.
    pub fn listen_for_returns(&self) -> Result<Receiver<Return>> {
        self.with_state(|state| {
            let (tx, rx) = crossbeam_channel::unbounded();
            Self::handle_of(state).set_return_handler(Some(tx.clone()))?;
            state.return_handler = Some(tx);
            Ok(rx)
        })
    }

    // ---- consuming ----------------------------------------------------

    /// Set the channel's prefetch window. Applied before consumers during
    /// recovery.
    pub fn qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.with_state(|state| {
            let qos = basic::Qos {
                prefetch_size,
                prefetch_count,
                global,
            };
            Self::handle_of(state).qos(qos)?;
            state.qos = Some(qos);
            Ok(())
        })
    }

    /// Start a consumer on `queue`; messages arrive on the returned
    /// [`Consumer`]'s receiver.
    pub fn basic_consume<S: Into<String>>(
        &self,
        queue: S,
        options: ConsumerOptions,
    ) -> Result<Consumer<'_>> {
        let queue = queue.into();
        let (tag, rx) = self.with_state(|state| {
            let (tx, rx) = crossbeam_channel::unbounded();
            let tag = Self::handle_of(state).consume(
                basic::Consume {
                    ticket: 0,
                    queue: queue.clone(),
                    consumer_tag: String::new(),
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                    arguments: options.arguments.clone(),
                },
                tx.clone(),
            )?;
            state.consumers.insert(
                tag.clone(),
                RecordedConsumer {
                    queue: queue.clone(),
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    arguments: options.arguments.clone(),
                    sink: tx,
                },
            );
            Ok((tag, rx))
        })?;
        debug!("started consumer {} on queue {}", tag, queue);
        Ok(Consumer::new(self, tag, rx))
    }

    /// Fetch a single message synchronously; `None` if the queue is empty.
    pub fn basic_get<S: Into<String>>(&self, queue: S, no_ack: bool) -> Result<Option<Get>> {
        let queue = queue.into();
        self.with_state(|state| {
            Self::handle_of(state).get(basic::Get {
                ticket: 0,
                queue: queue.clone(),
                no_ack,
            })
        })
    }

    pub(crate) fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_state(|state| {
            Self::handle_of(state).cancel_consumer(consumer_tag.to_string())?;
            state.consumers.shift_remove(consumer_tag);
            Ok(())
        })
    }

    pub(crate) fn acker(&self) -> Result<Acker> {
        self.with_state(|state| Ok(Self::handle_of(state).acker()))
    }

    /// Default worker count for [`Consumer::dispatch`].
    pub(crate) fn default_dispatch_concurrency(&self) -> usize {
        self.conn.options().consumer_dispatch_concurrency
    }

    // ---- acks ---------------------------------------------------------

    pub fn basic_ack(&self, delivery: &Delivery, multiple: bool) -> Result<()> {
        self.with_state(|state| {
            Self::handle_of(state).ack(basic::Ack {
                delivery_tag: delivery.delivery_tag(),
                multiple,
            })
        })
    }

    pub fn basic_nack(&self, delivery: &Delivery, multiple: bool, requeue: bool) -> Result<()> {
        self.with_state(|state| {
            Self::handle_of(state).nack(basic::Nack {
                delivery_tag: delivery.delivery_tag(),
                multiple,
                requeue,
            })
        })
    }

    pub fn basic_reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.with_state(|state| {
            Self::handle_of(state).reject(basic::Reject {
                delivery_tag: delivery.delivery_tag(),
                requeue,
            })
        })
    }

    /// Ask the server to pause (`active = false`) or resume deliveries on
    /// this channel; returns the server's resulting flow state.
    pub fn channel_flow(&self, active: bool) -> Result<bool> {
        self.with_state(|state| Self::handle_of(state).flow(active))
    }
}
