use crate::confirm::{Confirm, ConfirmStatus, ConfirmTracker};
use crate::connection::ConnectionBlockedNotification;
use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::frame_buffer::FrameBuffer;
use crate::heartbeats::{HeartbeatKind, HeartbeatState, HeartbeatTimers};
use crate::notification_listeners::NotificationListeners;
use crate::serialize::{IntoAmqpClass, OutputBuffer, SealableOutputBuffer};
use crate::stream::IoStream;
use crate::wire::method::connection::TuneOk;
use crate::wire::{AmqpClass, AmqpFrame, FieldTable};
use crate::{ConsumerMessage, Return};
use crossbeam_channel::Receiver as CrossbeamReceiver;
use crossbeam_channel::Sender as CrossbeamSender;
use indexmap::{IndexMap, IndexSet};
use log::{debug, error, trace, warn};
use mio::{Event, Evented, Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::sync_channel as mio_sync_channel;
use mio_extras::channel::Receiver as MioReceiver;
use snafu::ResultExt;
use std::io::{self, Write};
use std::sync::mpsc::TryRecvError;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

mod channel_arena;
mod channel_handle;
mod connection_state;
mod content_collector;
mod handshake_state;
mod io_loop_handle;

pub(crate) use channel_handle::{Channel0Handle, ChannelHandle};
pub use channel_handle::Acker;
use channel_arena::ChannelArena;
use connection_state::ConnectionState;
use content_collector::ContentCollector;
use handshake_state::HandshakeState;
use io_loop_handle::{IoLoopHandle, IoLoopHandle0};

const STREAM: Token = Token(u16::max_value() as usize + 1);
const HEARTBEAT: Token = Token(u16::max_value() as usize + 2);
const ALLOC_CHANNEL: Token = Token(u16::max_value() as usize + 3);

pub(crate) enum IoLoopMessage {
    /// Serialized frames to append to the write buffer.
    Send(OutputBuffer),

    /// A publish (method + header + body frames). If the channel is in
    /// confirm mode, the I/O thread assigns the next confirm sequence as it
    /// appends the frames, binding the completion cell to it.
    SendPublish(OutputBuffer, Option<CrossbeamSender<ConfirmStatus>>),

    /// connection.close - append, then seal the buffer.
    ConnectionClose(OutputBuffer),

    /// Arm the channel's publisher-confirm tracker (select-ok was
    /// received).
    EnableConfirms,

    SetReturnHandler(Option<CrossbeamSender<Return>>),
    SetConfirmHandler(Option<CrossbeamSender<Confirm>>),

    /// Delivery sink for the next basic.consume on this channel.
    SetPendingConsumer(CrossbeamSender<ConsumerMessage>),
}

pub(crate) enum ChannelMessage {
    /// An RPC reply.
    Method(AmqpClass),

    /// consume-ok, carrying the (possibly server-generated) consumer tag.
    ConsumeOk(String),

    /// get-ok (with content) or get-empty.
    GetOk(Box<Option<crate::Get>>),
}

pub(crate) struct ChannelSlot {
    rx: MioReceiver<IoLoopMessage>,
    tx: CrossbeamSender<Result<ChannelMessage>>,
    collector: ContentCollector,
    consumers: IndexMap<String, CrossbeamSender<ConsumerMessage>>,
    pending_consumer: Option<CrossbeamSender<ConsumerMessage>>,
    return_handler: Option<CrossbeamSender<Return>>,
    confirm_handler: Option<CrossbeamSender<Confirm>>,
    confirm_tracker: Option<ConfirmTracker>,
    flow_active: bool,
}

impl ChannelSlot {
    fn new(
        mio_channel_bound: usize,
        channel_id: u16,
        continuation_timeout: Duration,
        max_body_size: u64,
    ) -> (ChannelSlot, IoLoopHandle) {
        let (mio_tx, mio_rx) = mio_sync_channel(mio_channel_bound);

        // Bound of 2 is intentional here. The normal case for this channel
        // is that it will have at most 1 message in it (the response to a
        // synchronous RPC call). However, we might asynchronously receive a
        // channel-close message from the server, and there should be room
        // to push that into this channel as well. If we try to send to this
        // channel and get blocked, we will exit the I/O loop quickly as
        // something has gone wrong internally; either a channel client has
        // tried to send 2 RPC synchronous calls without waiting for the
        // answer to the first, or the server has sent us multiple messages
        // unrelated to RPC requests. Either way, the connection is in a bad
        // state - bail out.
        let (tx, rx) = crossbeam_channel::bounded(2);

        let channel_slot = ChannelSlot {
            rx: mio_rx,
            tx,
            collector: ContentCollector::new(max_body_size),
            consumers: IndexMap::new(),
            pending_consumer: None,
            return_handler: None,
            confirm_handler: None,
            confirm_tracker: None,
            flow_active: true,
        };

        let loop_handle = IoLoopHandle::new(channel_id, mio_tx, rx, continuation_timeout);

        (channel_slot, loop_handle)
    }
}

pub(crate) struct Channel0Slot {
    common: ChannelSlot,
    alloc_chan_req_rx: MioReceiver<Option<u16>>,
    alloc_chan_rep_tx: CrossbeamSender<Result<IoLoopHandle>>,
}

impl Channel0Slot {
    fn new(
        mio_channel_bound: usize,
        continuation_timeout: Duration,
        max_body_size: u64,
    ) -> (Channel0Slot, IoLoopHandle0) {
        let (common_slot, common_handle) =
            ChannelSlot::new(mio_channel_bound, 0, continuation_timeout, max_body_size);
        let (alloc_chan_req_tx, alloc_chan_req_rx) = mio_sync_channel(1);
        let (alloc_chan_rep_tx, alloc_chan_rep_rx) = crossbeam_channel::bounded(1);

        let slot = Channel0Slot {
            common: common_slot,
            alloc_chan_req_rx,
            alloc_chan_rep_tx,
        };
        let handle = IoLoopHandle0::new(common_handle, alloc_chan_req_tx, alloc_chan_rep_rx);

        (slot, handle)
    }
}

/// Knobs for the I/O thread's internal buffers.
#[derive(Clone, Debug)]
pub struct ConnectionTuning {
    /// Bound for the in-memory channels carrying frames from channel
    /// handles into the I/O thread; publishers block (per channel) when
    /// full.
    pub mem_channel_bound: usize,

    /// Stop draining non-0 channel queues once this much serialized data is
    /// waiting to be written.
    pub buffered_writes_high_water: usize,

    /// Resume draining once the backlog falls below this.
    pub buffered_writes_low_water: usize,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        ConnectionTuning {
            mem_channel_bound: 256,
            buffered_writes_high_water: 16 << 20,
            buffered_writes_low_water: 0,
        }
    }
}

impl ConnectionTuning {
    pub fn mem_channel_bound(self, mem_channel_bound: usize) -> Self {
        ConnectionTuning {
            mem_channel_bound,
            ..self
        }
    }

    pub fn buffered_writes_high_water(self, buffered_writes_high_water: usize) -> Self {
        ConnectionTuning {
            buffered_writes_high_water,
            ..self
        }
    }

    pub fn buffered_writes_low_water(self, buffered_writes_low_water: usize) -> Self {
        ConnectionTuning {
            buffered_writes_low_water,
            ..self
        }
    }
}

/// Everything the connection layer gets back from a successful handshake.
pub(crate) struct SessionHandles {
    pub(crate) join_handle: JoinHandle<Result<()>>,
    pub(crate) server_properties: FieldTable,
    pub(crate) channel0: Channel0Handle,
}

/// The connection's I/O thread: sole reader and sole writer of the
/// transport. Channel handles talk to it through bounded in-memory
/// channels; it never blocks on user code.
pub(crate) struct IoLoop {
    poll: Poll,
    frame_buffer: FrameBuffer,
    inner: Inner,

    handshake_timeout: Duration,
    socket_write_timeout: Option<Duration>,

    // Deadline for the current handshake step; refreshed on inbound
    // progress, None once the connection is open.
    handshake_deadline: Option<Instant>,

    // Bound for buffered outgoing writes. If we have more than this much
    // data enqueued, we stop polling non-0 channels' requests for us to
    // send more data.
    buffered_writes_high_water: usize,
    buffered_writes_low_water: usize,
}

impl IoLoop {
    pub(crate) fn new(options: &ConnectionOptions, tuning: ConnectionTuning) -> Result<Self> {
        let heartbeats = HeartbeatTimers::default();

        let poll = Poll::new().context(CreatePollHandleSnafu)?;
        poll.register(
            &heartbeats.timer,
            HEARTBEAT,
            Ready::readable(),
            PollOpt::edge(),
        )
        .context(RegisterWithPollHandleSnafu)?;

        Ok(IoLoop {
            poll,
            frame_buffer: FrameBuffer::new(),
            inner: Inner::new(
                heartbeats,
                tuning.mem_channel_bound,
                options.continuation_timeout,
                options.max_inbound_message_body_size,
            ),
            handshake_timeout: options.handshake_timeout,
            socket_write_timeout: options.socket_write_timeout,
            handshake_deadline: None,
            buffered_writes_high_water: tuning.buffered_writes_high_water,
            buffered_writes_low_water: tuning.buffered_writes_low_water,
        })
    }

    pub(crate) fn start<S: IoStream>(
        mut self,
        stream: S,
        options: ConnectionOptions,
        blocked_listeners: NotificationListeners<ConnectionBlockedNotification>,
    ) -> Result<SessionHandles> {
        self.poll
            .register(&stream, STREAM, Ready::writable(), PollOpt::edge())
            .context(RegisterWithPollHandleSnafu)?;

        self.inner.blocked_listeners = blocked_listeners;
        self.handshake_deadline = Some(Instant::now() + self.handshake_timeout);

        let (handshake_done_tx, handshake_done_rx) = crossbeam_channel::bounded(1);
        let (ch0_slot, ch0_handle) = Channel0Slot::new(
            self.inner.mio_channel_bound,
            self.inner.continuation_timeout,
            self.inner.max_body_size,
        );

        let join_handle = Builder::new()
            .name("coney-io".to_string())
            .spawn(move || self.thread_main(stream, options, handshake_done_tx, ch0_slot))
            .context(ForkFailedSnafu)?;

        IoLoop::wait_for_amqp_handshake(ch0_handle, join_handle, handshake_done_rx)
    }

    fn wait_for_amqp_handshake(
        ch0_handle: IoLoopHandle0,
        join_handle: JoinHandle<Result<()>>,
        handshake_done_rx: CrossbeamReceiver<(TuneOk, FieldTable)>,
    ) -> Result<SessionHandles> {
        match handshake_done_rx.recv() {
            Ok((tune_ok, server_properties)) => Ok(SessionHandles {
                join_handle,
                server_properties,
                channel0: Channel0Handle::new(ch0_handle, tune_ok.frame_max as usize),
            }),

            // If sender was dropped without sending, the I/O thread has
            // failed; peel out its final error.
            Err(_) => match join_handle.join() {
                Ok(Ok(())) => {
                    unreachable!("I/O thread ended successfully without completing handshake")
                }
                Ok(Err(err)) => Err(err),
                Err(_) => IoThreadPanicSnafu.fail(),
            },
        }
    }

    fn thread_main<S: IoStream>(
        mut self,
        mut stream: S,
        options: ConnectionOptions,
        handshake_done_tx: CrossbeamSender<(TuneOk, FieldTable)>,
        ch0_slot: Channel0Slot,
    ) -> Result<()> {
        self.poll
            .register(
                &ch0_slot.common.rx,
                Token(0),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        self.poll
            .register(
                &ch0_slot.alloc_chan_req_rx,
                ALLOC_CHANNEL,
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;

        let result = self.session_main(&mut stream, options, handshake_done_tx, ch0_slot);
        if let Err(err) = &result {
            self.inner.notify_teardown(err.clone());
        } else {
            self.inner.notify_clean_close();
        }
        result
    }

    fn session_main<S: IoStream>(
        &mut self,
        stream: &mut S,
        options: ConnectionOptions,
        handshake_done_tx: CrossbeamSender<(TuneOk, FieldTable)>,
        ch0_slot: Channel0Slot,
    ) -> Result<()> {
        let (tune_ok, server_properties) = self.run_amqp_handshake(stream, options)?;

        // frame-max counts the whole frame, header and end octet included
        self.frame_buffer
            .set_max_frame_size(tune_ok.frame_max as usize);
        self.handshake_deadline = None;
        self.inner.chan_slots.set_channel_max(tune_ok.channel_max);

        // the write deadline is the larger of the socket timeout and the
        // negotiated heartbeat interval
        if let Some(write_timeout) = self.socket_write_timeout.as_mut() {
            let heartbeat = Duration::from_secs(u64::from(tune_ok.heartbeat));
            if heartbeat > *write_timeout {
                *write_timeout = heartbeat;
            }
        }

        match handshake_done_tx.send((tune_ok, server_properties)) {
            Ok(_) => (),
            // caller vanished during the handshake; nothing to run
            Err(_) => return Ok(()),
        }
        self.run_connection(stream, ch0_slot)
    }

    fn run_amqp_handshake<S: IoStream>(
        &mut self,
        stream: &mut S,
        options: ConnectionOptions,
    ) -> Result<(TuneOk, FieldTable)> {
        let mut state = HandshakeState::Start(options);
        let result = self.run_io_loop(
            stream,
            &mut state,
            Self::handle_handshake_event,
            false,
            Self::is_handshake_done,
        );
        match result {
            Ok(()) => (),
            Err(err) => {
                // If our credentials are bad, the socket is dropped without
                // a message, but we can detect that if we had gotten up to
                // the post-start-ok state before failing.
                return match (&err, state.awaiting_post_start()) {
                    (Error::UnexpectedSocketClose, true) => InvalidCredentialsSnafu.fail(),
                    _ => Err(err),
                };
            }
        }
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _, _)
            | HandshakeState::Tune(_, _, _)
            | HandshakeState::Open(_, _) => unreachable!(),
            HandshakeState::Done(tune_ok, server_properties) => Ok((tune_ok, server_properties)),
            HandshakeState::ServerClosing(close) => ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail(),
        }
    }

    fn handle_handshake_event<S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut HandshakeState,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    let n = self.inner.read_from_stream(
                        stream,
                        &mut self.frame_buffer,
                        |inner, frame| state.process(inner, frame),
                    )?;
                    if n > 0 {
                        // each step of the handshake gets a fresh budget
                        self.handshake_deadline =
                            Some(Instant::now() + self.handshake_timeout);
                    }
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            _ => unreachable!(),
        }
        Ok(())
    }

    fn is_handshake_done(&self, state: &HandshakeState) -> bool {
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _, _)
            | HandshakeState::Tune(_, _, _)
            | HandshakeState::Open(_, _) => false,
            HandshakeState::Done(_, _) => true,
            HandshakeState::ServerClosing(_) => {
                // server initiated a close (e.g., bad vhost). don't report
                // that we're done until all our writes have gone out
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes should be sealed after getting a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn run_connection<S: IoStream>(&mut self, stream: &mut S, ch0_slot: Channel0Slot) -> Result<()> {
        let mut state = ConnectionState::Steady(ch0_slot);
        self.run_io_loop(
            stream,
            &mut state,
            Self::handle_steady_event,
            true,
            Self::is_connection_done,
        )?;
        match state {
            ConnectionState::Steady(_) => unreachable!(),
            ConnectionState::ServerClosing(close) => ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail(),
            ConnectionState::ClientException => ClientExceptionSnafu.fail(),
            ConnectionState::ClientClosed => Ok(()),
        }
    }

    fn handle_steady_event<S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut ConnectionState,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner.read_from_stream(
                        stream,
                        &mut self.frame_buffer,
                        |inner, frame| state.process(inner, frame),
                    )?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            ALLOC_CHANNEL => match &state {
                ConnectionState::Steady(ch0_slot) => {
                    self.inner.allocate_channel(ch0_slot, &self.poll)?
                }
                ConnectionState::ServerClosing(_)
                | ConnectionState::ClientException
                | ConnectionState::ClientClosed => {
                    unreachable!("ch0 slot cannot be readable after it is dropped")
                }
            },
            Token(0) => match &state {
                ConnectionState::Steady(ch0_slot) => {
                    self.inner.handle_channel0_readable(ch0_slot)?
                }
                ConnectionState::ServerClosing(_)
                | ConnectionState::ClientException
                | ConnectionState::ClientClosed => {
                    unreachable!("ch0 slot cannot be readable after it is dropped")
                }
            },
            Token(n) if n <= u16::max_value() as usize => {
                self.inner.handle_channel_readable(n as u16)?
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn is_connection_done(&self, state: &ConnectionState) -> bool {
        match state {
            ConnectionState::Steady(_) => false,
            ConnectionState::ClientClosed => true,
            ConnectionState::ServerClosing(_) | ConnectionState::ClientException => {
                // we're mid-close, but not actually done until all our
                // writes have gone out
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes should be sealed after getting a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let mut timeout: Option<Duration> = None;
        let mut consider = |candidate: Option<Duration>| {
            if let Some(candidate) = candidate {
                timeout = Some(match timeout {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            }
        };
        consider(self.handshake_deadline.map(|deadline| {
            deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default()
        }));
        if self.inner.write_stall_since.is_some() {
            consider(self.socket_write_timeout);
        }
        timeout
    }

    fn check_deadlines(&mut self) -> Result<()> {
        if let Some(deadline) = self.handshake_deadline {
            if Instant::now() >= deadline {
                return HandshakeTimeoutSnafu.fail();
            }
        }
        if let (Some(stalled_at), Some(limit)) =
            (self.inner.write_stall_since, self.socket_write_timeout)
        {
            if stalled_at.elapsed() >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "socket write stalled past the write timeout",
                ))
                .context(IoErrorWritingSocketSnafu);
            }
        }
        Ok(())
    }

    fn run_io_loop<State, S, F, G>(
        &mut self,
        stream: &mut S,
        state: &mut State,
        mut handle_event: F,
        mut have_written_to_socket: bool,
        is_done: G,
    ) -> Result<()>
    where
        S: Evented,
        F: FnMut(&mut Self, &mut S, &mut State, Event) -> Result<()>,
        G: Fn(&Self, &State) -> bool,
    {
        // We're called twice (AMQP handshake, then the main loop), so we
        // don't know whether the socket is registered for RW or just R at
        // entry. If we have outgoing data (e.g. the protocol header),
        // reregister for RW.
        //
        // HOWEVER - on Windows, it's important not to reregister for
        // readable until we've written some data on the socket; otherwise
        // we can get spurious readable wakeups which lead to a NotConnected
        // error when we try to actually read. have_written_to_socket lets
        // us track this; see https://github.com/tokio-rs/mio/issues/648.
        if self.inner.has_data_to_write() && have_written_to_socket {
            trace!("reregistering socket for readable or writable");
            self.poll
                .reregister(
                    stream,
                    STREAM,
                    Ready::readable() | Ready::writable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
        }

        let mut events = Events::with_capacity(128);
        let mut listening_to_channels = true;
        loop {
            self.poll
                .poll(&mut events, self.poll_timeout())
                .context(FailedToPollSnafu)?;
            self.check_deadlines()?;
            if events.is_empty() {
                continue;
            }

            let had_data_to_write = self.inner.has_data_to_write();

            for event in events.iter() {
                handle_event(self, stream, state, event)?;
            }

            if is_done(self, state) {
                return Ok(());
            }

            // Avoid out-of-memory from very fast publishers. If we have
            // more than buffered_writes_high_water data enqueued to write
            // already, unregister all channels (other than channel 0), and
            // don't reregister until we're down to low water. The reader
            // side stays registered, so inbound frames keep flowing.
            if listening_to_channels && self.inner.outbuf.len() > self.buffered_writes_high_water {
                debug!("passed high water mark for buffered writes; blocking channels internally");
                self.inner.deregister_nonzero_channels(&self.poll)?;
                listening_to_channels = false;
            } else if !listening_to_channels
                && self.inner.outbuf.len() <= self.buffered_writes_low_water
            {
                debug!("returned below low water mark for buffered writes; resuming channels");
                self.inner.reregister_nonzero_channels(&self.poll)?;
                listening_to_channels = true;
            }

            // If we have data to write, reregister for readable|writable.
            // This may be a spurious reregistration, but also may not - if
            // we wrote all the data we have but didn't get a WouldBlock,
            // and then later in the processing loop added more data to
            // write but didn't write it, mio won't wake us back up again
            // next pass unless we reregister.
            //
            // If we don't have data to write, only reregister for readable
            // (without writable) if we had data to write after the last
            // poll; otherwise we know we were already registered as
            // readable only and don't need to rereg.
            if self.inner.has_data_to_write() && have_written_to_socket {
                trace!("reregistering socket for readable or writable");
                self.poll
                    .reregister(
                        stream,
                        STREAM,
                        Ready::readable() | Ready::writable(),
                        PollOpt::edge(),
                    )
                    .context(RegisterWithPollHandleSnafu)?;
            } else if had_data_to_write {
                trace!("reregistering socket for readable only");
                have_written_to_socket = true;
                self.poll
                    .reregister(stream, STREAM, Ready::readable(), PollOpt::edge())
                    .context(RegisterWithPollHandleSnafu)?;
            }
        }
    }
}

pub(crate) struct Inner {
    // Buffer of data waiting to be written. May contain multiple serialized
    // frames. Once we've appended a connection Close or CloseOk, it will be
    // sealed (so any future writes will be silently discarded).
    outbuf: SealableOutputBuffer,

    // Handle to I/O loop timers for tracking rx/tx heartbeats.
    heartbeats: HeartbeatTimers,

    // Slots for open channels. Channel 0 is handled separately.
    pub(in crate::io_loop) chan_slots: ChannelArena<ChannelSlot>,

    // Channels we are unilaterally closing (we sent channel.close after a
    // per-channel protocol problem); inbound frames are discarded until the
    // close-ok arrives.
    pub(in crate::io_loop) closing_channels: IndexSet<u16>,

    // Listener registry for connection.blocked / unblocked; owned by the
    // connection so it survives recovery.
    pub(in crate::io_loop) blocked_listeners: NotificationListeners<ConnectionBlockedNotification>,

    // Bound for in-memory channels that send to our I/O thread. (Channels
    // going _from_ the I/O thread are unbounded to prevent blocking the I/O
    // thread on slow receivers.)
    mio_channel_bound: usize,

    continuation_timeout: Duration,
    max_body_size: u64,

    // Set when a write hit WouldBlock with data still buffered; cleared
    // when the buffer fully drains. Basis of the write timeout.
    write_stall_since: Option<Instant>,

    // If true, non-0 channels are registered with mio. (Channel 0 is always
    // registered.)
    channels_are_registered: bool,
}

impl Inner {
    fn new(
        heartbeats: HeartbeatTimers,
        mio_channel_bound: usize,
        continuation_timeout: Duration,
        max_body_size: u64,
    ) -> Self {
        Inner {
            outbuf: SealableOutputBuffer::new(OutputBuffer::with_protocol_header()),
            heartbeats,
            chan_slots: ChannelArena::new(),
            closing_channels: IndexSet::new(),
            blocked_listeners: NotificationListeners::new(),
            mio_channel_bound,
            continuation_timeout,
            max_body_size,
            write_stall_since: None,
            channels_are_registered: true,
        }
    }

    #[inline]
    fn are_writes_sealed(&self) -> bool {
        self.outbuf.is_sealed()
    }

    #[inline]
    fn seal_writes(&mut self) {
        trace!("sealing writes - no more data should be enqueued");
        self.outbuf.seal();
    }

    #[inline]
    pub(in crate::io_loop) fn push_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        self.outbuf.push_method(channel_id, method)
    }

    /// Start heartbeat timers after tuning. The read deadline is
    /// `max(2 x heartbeat, socket read timeout)`; the larger value wins by
    /// design, even though that can mask a stuck peer for longer.
    fn start_heartbeats(&mut self, interval: u16, socket_read_timeout: Option<Duration>) {
        let tx_interval = if interval > 0 {
            Some(Duration::from_secs(u64::from(interval)))
        } else {
            None
        };
        let hb_deadline = tx_interval.map(|i| 2 * i);
        let rx_deadline = match (hb_deadline, socket_read_timeout) {
            (Some(hb), Some(socket)) => Some(hb.max(socket)),
            (Some(hb), None) => Some(hb),
            (None, socket) => socket,
        };
        if tx_interval.is_some() || rx_deadline.is_some() {
            debug!(
                "starting heartbeat timers (tx = {:?}, rx deadline = {:?})",
                tx_interval, rx_deadline
            );
            self.heartbeats.start(tx_interval, rx_deadline);
        }
    }

    #[inline]
    fn has_data_to_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    fn deregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (_, slot) in self.chan_slots.iter() {
            poll.deregister(&slot.rx)
                .context(DeregisterWithPollHandleSnafu)?;
        }
        self.channels_are_registered = false;
        Ok(())
    }

    fn reregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (id, slot) in self.chan_slots.iter() {
            poll.reregister(
                &slot.rx,
                Token(id as usize),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        }
        self.channels_are_registered = true;
        Ok(())
    }

    fn process_heartbeat_timers(&mut self) -> Result<()> {
        while let Some(kind) = self.heartbeats.timer.poll() {
            match kind {
                HeartbeatKind::Rx => match self.heartbeats.fire_rx() {
                    HeartbeatState::StillRunning => {
                        trace!("rx heartbeat timer fired, but have received data since last");
                    }
                    HeartbeatState::Expired => {
                        error!("missed heartbeats from server - closing connection");
                        return MissedServerHeartbeatsSnafu.fail();
                    }
                },
                HeartbeatKind::Tx => match self.heartbeats.fire_tx() {
                    HeartbeatState::StillRunning => {
                        trace!("tx heartbeat timer fired, but have sent data since last");
                    }
                    HeartbeatState::Expired => {
                        // if we already have data queued up to send, don't
                        // bother also enqueuing up a heartbeat frame
                        if self.outbuf.is_empty() {
                            debug!("sending heartbeat");
                            self.outbuf.push_heartbeat();
                        } else {
                            warn!("tx heartbeat fired, but already have queued data to write - possible socket problem");
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn handle_channel0_readable(&mut self, ch0_slot: &Channel0Slot) -> Result<()> {
        loop {
            match ch0_slot.common.rx.try_recv() {
                Ok(message) => self.process_channel_message(0, message)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
            }
        }
    }

    fn handle_channel_readable(&mut self, channel_id: u16) -> Result<()> {
        loop {
            let slot = match self.chan_slots.get(channel_id) {
                Some(slot) => slot,
                None => {
                    // We've been asked to poll a receiver for a channel we
                    // dropped; this is rare, but could happen if (e.g.) the
                    // server initiated a Close in this same poll processing
                    // loop and we already saw it. In that case, we've
                    // already removed channel_id from chan_slots, but now
                    // we've landed in a still-pending readable event from
                    // poll. Bail out now without an error; the dropped
                    // channel will propagate an appropriate message back
                    // out to the channel handle.
                    return Ok(());
                }
            };
            match slot.rx.try_recv() {
                Ok(message) => self.process_channel_message(channel_id, message)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
            }
        }
    }

    fn process_channel_message(&mut self, channel_id: u16, message: IoLoopMessage) -> Result<()> {
        match message {
            IoLoopMessage::ConnectionClose(buf) => {
                self.outbuf.append(buf);
                self.seal_writes();
            }
            IoLoopMessage::Send(buf) => {
                self.outbuf.append(buf);
            }
            IoLoopMessage::SendPublish(buf, confirm_cell) => {
                // Sequence assignment happens here, on the writer path, so
                // confirm sequences match wire order exactly.
                if channel_id != 0 {
                    // unwrap is safe: we were called because this slot's
                    // receiver was readable
                    let slot = self.chan_slots.get_mut(channel_id).unwrap();
                    if !slot.flow_active {
                        warn!("publishing on channel {} while the server has paused it", channel_id);
                    }
                    if let Some(tracker) = slot.confirm_tracker.as_mut() {
                        let seq = tracker.assign(confirm_cell);
                        trace!("assigned confirm sequence {} on channel {}", seq, channel_id);
                    }
                }
                self.outbuf.append(buf);
            }
            IoLoopMessage::EnableConfirms => {
                assert!(channel_id != 0, "channel 0 cannot enter confirm mode");
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                if slot.confirm_tracker.is_none() {
                    slot.confirm_tracker = Some(ConfirmTracker::new());
                }
            }
            IoLoopMessage::SetReturnHandler(handler) => {
                assert!(channel_id != 0, "channel 0 cannot have a return handler");
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                slot.return_handler = handler;
            }
            IoLoopMessage::SetConfirmHandler(handler) => {
                assert!(channel_id != 0, "channel 0 cannot have a confirm handler");
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                slot.confirm_handler = handler;
            }
            IoLoopMessage::SetPendingConsumer(sink) => {
                assert!(channel_id != 0, "channel 0 cannot have consumers");
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                slot.pending_consumer = Some(sink);
            }
        }
        Ok(())
    }

    fn allocate_channel(&mut self, ch0_slot: &Channel0Slot, poll: &Poll) -> Result<()> {
        loop {
            let new_channel_id = match ch0_slot.alloc_chan_req_rx.try_recv() {
                Ok(new_channel_id) => new_channel_id,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
            };

            let mio_channel_bound = self.mio_channel_bound;
            let continuation_timeout = self.continuation_timeout;
            let max_body_size = self.max_body_size;
            let channels_are_registered = self.channels_are_registered;
            let result = self.chan_slots.insert(new_channel_id, |new_channel_id| {
                let (slot, handle) = ChannelSlot::new(
                    mio_channel_bound,
                    new_channel_id,
                    continuation_timeout,
                    max_body_size,
                );
                poll.register(
                    &slot.rx,
                    Token(new_channel_id as usize),
                    Ready::readable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
                if !channels_are_registered {
                    // If we're currently in a deregistered state (i.e., too
                    // much data to write), go ahead and deregister this new
                    // channel. We do the register + deregister dance so we
                    // can call reregister on this new channel even though
                    // it hadn't existed when we deregistered all the
                    // existing channels.
                    poll.deregister(&slot.rx)
                        .context(DeregisterWithPollHandleSnafu)?;
                }
                Ok((slot, handle))
            });
            match ch0_slot.alloc_chan_rep_tx.send(result) {
                Ok(()) => (),
                Err(crossbeam_channel::SendError(Ok(handle))) => {
                    // send failed - clear the allocated channel
                    self.chan_slots.remove(handle.channel_id());
                }
                Err(crossbeam_channel::SendError(Err(_))) => {
                    // send failed, but so did channel creation. do nothing
                }
            }
        }
    }

    fn read_from_stream<S, F>(
        &mut self,
        stream: &mut S,
        frame_buffer: &mut FrameBuffer,
        mut handler: F,
    ) -> Result<usize>
    where
        S: IoStream,
        F: FnMut(&mut Inner, AmqpFrame) -> Result<()>,
    {
        let n = frame_buffer.read_from(stream, |frame| {
            trace!("read frame {:?}", frame);
            handler(self, frame)
        })?;
        if n > 0 {
            self.heartbeats.record_rx_activity();
        }
        Ok(n)
    }

    fn write_to_stream<S: IoStream>(&mut self, stream: &mut S) -> Result<()> {
        let len = self.outbuf.len();
        let mut pos = 0;

        // Keep writing until we've written all len bytes or we hit
        // WouldBlock.
        while pos < len {
            trace!("trying to write {} bytes", len - pos);
            let n = match stream.write(&self.outbuf[pos..]) {
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    self.heartbeats.record_tx_activity();
                    n
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.outbuf.drain_written(pos);
                        if self.write_stall_since.is_none() {
                            self.write_stall_since = Some(Instant::now());
                        }
                        return Ok(());
                    }
                    _ => return Err(err).context(IoErrorWritingSocketSnafu),
                },
            };
            pos += n;
        }

        // Wrote everything we have - use clear instead of .drain_written().
        self.outbuf.clear();
        self.write_stall_since = None;
        Ok(())
    }

    /// The connection died with `err`; tell every channel handle and every
    /// consumer stream so nothing hangs waiting on a dead I/O thread.
    fn notify_teardown(&mut self, err: Error) {
        for (_, slot) in self.chan_slots.drain() {
            for (_, consumer_tx) in slot.consumers.iter() {
                let _ = consumer_tx.send(ConsumerMessage::ServerClosedConnection(err.clone()));
            }
            let _ = slot.tx.send(Err(err.clone()));
        }
    }

    /// Orderly client-initiated close: consumers see a clean end of stream.
    fn notify_clean_close(&mut self) {
        for (_, slot) in self.chan_slots.drain() {
            for (_, consumer_tx) in slot.consumers.iter() {
                let _ = consumer_tx.send(ConsumerMessage::ClientClosedConnection);
            }
        }
    }
}
