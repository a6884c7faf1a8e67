use super::{ChannelMessage, IoLoopMessage};
use crate::cancellation::Cancellation;
use crate::confirm::ConfirmStatus;
use crate::errors::*;
use crate::serialize::{IntoAmqpClass, OutputBuffer, TryFromAmqpClass};
use log::error;
use mio_extras::channel::SyncSender as MioSyncSender;
use std::time::{Duration, Instant};

// How often a blocked RPC wait wakes up to check for cancellation.
const CANCEL_POLL_TICK: Duration = Duration::from_millis(50);

/// Caller-side endpoint of one channel's in-memory pipe to the I/O thread.
///
/// Holds the channel's single RPC continuation slot: sends are paired with
/// at most one awaited reply, and the owning mutex in [`Channel`] enforces
/// that a second RPC cannot start before the first resolves.
///
/// [`Channel`]: crate::Channel
pub(crate) struct IoLoopHandle {
    channel_id: u16,
    buf: OutputBuffer,
    tx: MioSyncSender<IoLoopMessage>,
    rx: crossbeam_channel::Receiver<Result<ChannelMessage>>,
    continuation_timeout: Duration,

    // Count of replies owed to cancelled RPCs. The server will still answer
    // them; they are drained and discarded before the next real reply.
    stale_replies: usize,
}

impl IoLoopHandle {
    pub(super) fn new(
        channel_id: u16,
        tx: MioSyncSender<IoLoopMessage>,
        rx: crossbeam_channel::Receiver<Result<ChannelMessage>>,
        continuation_timeout: Duration,
    ) -> IoLoopHandle {
        IoLoopHandle {
            channel_id,
            buf: OutputBuffer::empty(),
            tx,
            rx,
            continuation_timeout,
            stale_replies: 0,
        }
    }

    #[inline]
    pub(crate) fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub(super) fn make_buf<M: IntoAmqpClass>(&mut self, method: M) -> Result<OutputBuffer> {
        debug_assert!(self.buf.is_empty());
        // a failed push rolls the buffer back, so the handle stays reusable
        self.buf.push_method(self.channel_id, method)?;
        Ok(self.buf.drain_into_new_buf())
    }

    pub(crate) fn call<M: IntoAmqpClass, T: TryFromAmqpClass>(
        &mut self,
        method: M,
        cancellation: Option<&Cancellation>,
    ) -> Result<T> {
        let buf = self.make_buf(method)?;
        self.send(IoLoopMessage::Send(buf))?;
        match self.recv(cancellation)? {
            ChannelMessage::Method(method) => T::try_from(method),
            ChannelMessage::ConsumeOk(_) | ChannelMessage::GetOk(_) => {
                FrameUnexpectedSnafu.fail()
            }
        }
    }

    pub(crate) fn call_nowait<M: IntoAmqpClass>(&mut self, method: M) -> Result<()> {
        let buf = self.make_buf(method)?;
        self.send(IoLoopMessage::Send(buf))
    }

    /// Submit a fully-serialized publish (method + header + body frames).
    /// The confirm sequence, if the channel is in confirm mode, is assigned
    /// by the I/O thread when these frames enter the write buffer.
    pub(crate) fn send_publish(
        &mut self,
        buf: OutputBuffer,
        confirm_cell: Option<crossbeam_channel::Sender<ConfirmStatus>>,
    ) -> Result<()> {
        self.send(IoLoopMessage::SendPublish(buf, confirm_cell))
    }

    pub(crate) fn enable_confirms(&mut self) -> Result<()> {
        self.send(IoLoopMessage::EnableConfirms)
    }

    pub(crate) fn set_return_handler(
        &mut self,
        handler: Option<crossbeam_channel::Sender<crate::Return>>,
    ) -> Result<()> {
        self.send(IoLoopMessage::SetReturnHandler(handler))
    }

    pub(crate) fn set_confirm_handler(
        &mut self,
        handler: Option<crossbeam_channel::Sender<crate::Confirm>>,
    ) -> Result<()> {
        self.send(IoLoopMessage::SetConfirmHandler(handler))
    }

    /// Register the delivery sink for an upcoming `basic.consume`, then
    /// issue the consume and wait for its consume-ok.
    pub(crate) fn consume(
        &mut self,
        consume: crate::wire::method::basic::Consume,
        sink: crossbeam_channel::Sender<crate::ConsumerMessage>,
    ) -> Result<String> {
        use crate::wire::method::basic;
        self.send(IoLoopMessage::SetPendingConsumer(sink))?;
        let buf = self.make_buf(basic::Method::Consume(consume))?;
        self.send(IoLoopMessage::Send(buf))?;
        match self.recv(None)? {
            ChannelMessage::ConsumeOk(tag) => Ok(tag),
            ChannelMessage::Method(_) | ChannelMessage::GetOk(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(crate) fn get(
        &mut self,
        get: crate::wire::method::basic::Get,
    ) -> Result<Option<crate::Get>> {
        use crate::wire::method::basic;
        let buf = self.make_buf(basic::Method::Get(get))?;
        self.send(IoLoopMessage::Send(buf))?;
        match self.recv(None)? {
            ChannelMessage::GetOk(get) => Ok(*get),
            ChannelMessage::Method(_) | ChannelMessage::ConsumeOk(_) => {
                FrameUnexpectedSnafu.fail()
            }
        }
    }

    pub(crate) fn call_connection_close(
        &mut self,
        close: crate::wire::method::connection::Close,
    ) -> Result<crate::wire::method::connection::CloseOk> {
        use crate::wire::method::connection;
        let buf = self.make_buf(connection::Method::Close(close))?;
        self.send(IoLoopMessage::ConnectionClose(buf))?;
        match self.recv(None)? {
            ChannelMessage::Method(method) => TryFromAmqpClass::try_from(method),
            ChannelMessage::ConsumeOk(_) | ChannelMessage::GetOk(_) => {
                FrameUnexpectedSnafu.fail()
            }
        }
    }

    /// A clonable sender for fire-and-forget frames (consumer acks from
    /// worker threads).
    pub(crate) fn nowait_sender(&self) -> MioSyncSender<IoLoopMessage> {
        self.tx.clone()
    }

    pub(super) fn send(&mut self, message: IoLoopMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| self.check_recv_for_error())
    }

    fn recv(&mut self, cancellation: Option<&Cancellation>) -> Result<ChannelMessage> {
        let deadline = Instant::now() + self.continuation_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default();
            let tick = remaining.min(CANCEL_POLL_TICK);
            match self.rx.recv_timeout(tick) {
                Ok(Err(err)) => return Err(err),
                Ok(Ok(message)) => {
                    if self.stale_replies > 0 {
                        // reply owed to an RPC that was cancelled; discard
                        self.stale_replies -= 1;
                        continue;
                    }
                    return Ok(message);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if let Some(cancellation) = cancellation {
                        if cancellation.is_cancelled() {
                            // the server will still reply; remember to
                            // discard it before the next real RPC
                            self.stale_replies += 1;
                            return CancelledSnafu.fail();
                        }
                    }
                    if remaining.is_zero() {
                        return ContinuationTimeoutSnafu {
                            channel_id: self.channel_id,
                        }
                        .fail();
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return EventLoopDroppedSnafu.fail()
                }
            }
        }
    }

    pub(super) fn check_recv_for_error(&mut self) -> Error {
        // Failed to send to the I/O thread; possible causes are:
        //   1. Server closed channel; we should see if there's a relevant
        //      message waiting for us on rx.
        //   2. I/O loop is actually gone.
        // In either case, recv() will return Err. If it doesn't, we somehow
        // got a frame after a send failure - this should be impossible, but
        // return FrameUnexpected just in case.
        match self.recv(None) {
            Ok(_) => {
                error!("internal error - received unexpected frame after I/O thread disappeared");
                FrameUnexpectedSnafu.build()
            }
            Err(err) => err,
        }
    }
}

pub(crate) struct IoLoopHandle0 {
    common: IoLoopHandle,
    alloc_chan_req_tx: MioSyncSender<Option<u16>>,
    alloc_chan_rep_rx: crossbeam_channel::Receiver<Result<IoLoopHandle>>,
}

impl IoLoopHandle0 {
    pub(super) fn new(
        common: IoLoopHandle,
        alloc_chan_req_tx: MioSyncSender<Option<u16>>,
        alloc_chan_rep_rx: crossbeam_channel::Receiver<Result<IoLoopHandle>>,
    ) -> IoLoopHandle0 {
        IoLoopHandle0 {
            common,
            alloc_chan_req_tx,
            alloc_chan_rep_rx,
        }
    }

    pub(crate) fn allocate_channel(&mut self, channel_id: Option<u16>) -> Result<IoLoopHandle> {
        self.alloc_chan_req_tx
            .send(channel_id)
            .map_err(|_| self.common.check_recv_for_error())?;
        self.alloc_chan_rep_rx
            .recv()
            .map_err(|_| EventLoopDroppedSnafu.build())?
    }
}

impl std::ops::Deref for IoLoopHandle0 {
    type Target = IoLoopHandle;

    fn deref(&self) -> &IoLoopHandle {
        &self.common
    }
}

impl std::ops::DerefMut for IoLoopHandle0 {
    fn deref_mut(&mut self) -> &mut IoLoopHandle {
        &mut self.common
    }
}
