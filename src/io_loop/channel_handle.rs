use super::io_loop_handle::{IoLoopHandle, IoLoopHandle0};
use super::IoLoopMessage;
use crate::cancellation::Cancellation;
use crate::confirm::ConfirmStatus;
use crate::errors::*;
use crate::serialize::{OutputBuffer, TryFromAmqpClass};
use crate::wire::constants::{CLASS_BASIC, REPLY_SUCCESS};
use crate::wire::method::{basic, channel, confirm, connection, exchange, queue};
use crate::wire::AmqpProperties;
use crate::ConsumerMessage;
use log::{debug, trace};
use mio_extras::channel::SyncSender as MioSyncSender;

/// Facade over channel 0: connection-level operations only.
pub(crate) struct Channel0Handle {
    handle: IoLoopHandle0,
    frame_max: usize,
}

impl Channel0Handle {
    pub(super) fn new(handle: IoLoopHandle0, frame_max: usize) -> Channel0Handle {
        assert!(
            handle.channel_id() == 0,
            "handle for Channel0 must be channel 0"
        );
        Channel0Handle { handle, frame_max }
    }

    pub(crate) fn close_connection(&mut self) -> Result<()> {
        let close = connection::Close {
            reply_code: REPLY_SUCCESS,
            reply_text: "goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        };
        let close_ok = self.handle.call_connection_close(close)?;
        trace!("got connection close-ok: {:?}", close_ok);
        Ok(())
    }

    /// Allocate a channel id (dense from 1 unless explicitly requested) and
    /// complete the channel.open handshake on it.
    pub(crate) fn open_channel(&mut self, channel_id: Option<u16>) -> Result<ChannelHandle> {
        let mut handle = self.handle.allocate_channel(channel_id)?;

        debug!("opening channel {}", handle.channel_id());
        let open = channel::Method::Open(channel::Open {
            out_of_band: String::new(),
        });
        let open_ok: channel::OpenOk = handle.call(open, None)?;
        trace!("got channel open-ok: {:?}", open_ok);
        Ok(ChannelHandle {
            handle,
            frame_max: self.frame_max,
        })
    }
}

/// Typed operations for one open channel, backed by its RPC slot.
pub(crate) struct ChannelHandle {
    handle: IoLoopHandle,
    frame_max: usize,
}

impl ChannelHandle {
    #[inline]
    pub(crate) fn channel_id(&self) -> u16 {
        self.handle.channel_id()
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        let close = channel::Method::Close(channel::Close {
            reply_code: REPLY_SUCCESS,
            reply_text: String::new(),
            class_id: 0,
            method_id: 0,
        });
        debug!("closing channel {}", self.channel_id());
        let close_ok: channel::CloseOk = self.handle.call(close, None)?;
        trace!("got channel close-ok: {:?}", close_ok);
        Ok(())
    }

    pub(crate) fn call<M, T>(&mut self, method: M, cancellation: Option<&Cancellation>) -> Result<T>
    where
        M: crate::serialize::IntoAmqpClass,
        T: TryFromAmqpClass,
    {
        self.handle.call(method, cancellation)
    }

    pub(crate) fn queue_declare(
        &mut self,
        declare: queue::Declare,
        cancellation: Option<&Cancellation>,
    ) -> Result<queue::DeclareOk> {
        self.call(queue::Method::Declare(declare), cancellation)
    }

    pub(crate) fn exchange_declare(
        &mut self,
        declare: exchange::Declare,
        cancellation: Option<&Cancellation>,
    ) -> Result<exchange::DeclareOk> {
        self.call(exchange::Method::Declare(declare), cancellation)
    }

    pub(crate) fn qos(&mut self, qos: basic::Qos) -> Result<()> {
        let _ok: basic::QosOk = self.call(basic::Method::Qos(qos), None)?;
        Ok(())
    }

    /// Put the channel in confirm mode: run the select RPC, then arm the
    /// writer-side tracker so the next publish gets sequence 1.
    pub(crate) fn confirm_select(&mut self) -> Result<()> {
        let _ok: confirm::SelectOk =
            self.call(confirm::Method::Select(confirm::Select { nowait: false }), None)?;
        self.handle.enable_confirms()
    }

    pub(crate) fn flow(&mut self, active: bool) -> Result<bool> {
        let flow_ok: channel::FlowOk = self.call(channel::Method::Flow(channel::Flow { active }), None)?;
        Ok(flow_ok.active)
    }

    pub(crate) fn consume(
        &mut self,
        consume: basic::Consume,
        sink: crossbeam_channel::Sender<ConsumerMessage>,
    ) -> Result<String> {
        self.handle.consume(consume, sink)
    }

    pub(crate) fn cancel_consumer(&mut self, consumer_tag: String) -> Result<()> {
        let cancel = basic::Method::Cancel(basic::Cancel {
            consumer_tag,
            nowait: false,
        });
        let cancel_ok: basic::CancelOk = self.call(cancel, None)?;
        trace!("got cancel-ok: {:?}", cancel_ok);
        Ok(())
    }

    pub(crate) fn get(&mut self, get: basic::Get) -> Result<Option<crate::Get>> {
        self.handle.get(get)
    }

    /// Serialize and submit a publish: method, content header, and body
    /// frames fragmented to the negotiated frame-max. In confirm mode the
    /// I/O thread binds `confirm_cell` to the writer-assigned sequence.
    pub(crate) fn publish(
        &mut self,
        publish: basic::Publish,
        content: &[u8],
        properties: &AmqpProperties,
        confirm_cell: Option<crossbeam_channel::Sender<ConfirmStatus>>,
    ) -> Result<()> {
        let mut buf = OutputBuffer::empty();
        let channel_id = self.channel_id();
        buf.push_method(channel_id, basic::Method::Publish(publish))?;
        buf.push_content_header(channel_id, CLASS_BASIC, content.len(), properties)?;
        buf.push_content_body(channel_id, content, self.frame_max);
        self.handle.send_publish(buf, confirm_cell)
    }

    pub(crate) fn ack(&mut self, ack: basic::Ack) -> Result<()> {
        self.handle.call_nowait(basic::Method::Ack(ack))
    }

    pub(crate) fn nack(&mut self, nack: basic::Nack) -> Result<()> {
        self.handle.call_nowait(basic::Method::Nack(nack))
    }

    pub(crate) fn reject(&mut self, reject: basic::Reject) -> Result<()> {
        self.handle.call_nowait(basic::Method::Reject(reject))
    }

    pub(crate) fn set_return_handler(
        &mut self,
        handler: Option<crossbeam_channel::Sender<crate::Return>>,
    ) -> Result<()> {
        self.handle.set_return_handler(handler)
    }

    pub(crate) fn set_confirm_handler(
        &mut self,
        handler: Option<crossbeam_channel::Sender<crate::Confirm>>,
    ) -> Result<()> {
        self.handle.set_confirm_handler(handler)
    }

    /// An [`Acker`] for consumer worker threads; sends share the channel's
    /// pipe into the I/O thread but bypass its RPC slot.
    pub(crate) fn acker(&self) -> Acker {
        Acker {
            channel_id: self.channel_id(),
            tx: self.handle.nowait_sender(),
        }
    }
}

/// Clonable fire-and-forget ack path handed to consumer workers. Acks sent
/// after the channel closes fail with `ClientClosedChannel`.
#[derive(Clone)]
pub struct Acker {
    channel_id: u16,
    tx: MioSyncSender<IoLoopMessage>,
}

impl Acker {
    pub fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.send_nowait(basic::Method::Ack(basic::Ack {
            delivery_tag,
            multiple,
        }))
    }

    pub fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.send_nowait(basic::Method::Nack(basic::Nack {
            delivery_tag,
            multiple,
            requeue,
        }))
    }

    pub fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.send_nowait(basic::Method::Reject(basic::Reject {
            delivery_tag,
            requeue,
        }))
    }

    fn send_nowait(&self, method: basic::Method) -> Result<()> {
        let mut buf = OutputBuffer::empty();
        buf.push_method(self.channel_id, method)?;
        self.tx
            .send(IoLoopMessage::Send(buf))
            .map_err(|_| ClientClosedChannelSnafu.build())
    }
}
