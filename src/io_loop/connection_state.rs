use super::content_collector::CollectorResult;
use super::{Channel0Slot, ChannelMessage, ChannelSlot, Inner};
use crate::confirm::{Confirm, ConfirmPayload};
use crate::connection::ConnectionBlockedNotification;
use crate::errors::*;
use crate::wire::constants::{
    CLASS_BASIC, FRAME_ERROR, NOT_ALLOWED, NOT_IMPLEMENTED, UNEXPECTED_FRAME,
};
use crate::wire::method::{basic, channel, connection};
use crate::wire::types::clip_shortstr;
use crate::wire::{AmqpClass, AmqpFrame};
use crate::ConsumerMessage;
use indexmap::map::Entry;
use log::{error, trace, warn};

/// Steady-phase connection states (§ the open/closing/closed tail of the
/// connection lifecycle; the opening half lives in `HandshakeState`).
pub(super) enum ConnectionState {
    /// Normal operation.
    Steady(Channel0Slot),

    /// Server sent connection.close; we have replied close-ok and are
    /// flushing our writes.
    ServerClosing(connection::Close),

    /// We hit a protocol violation, sent connection.close ourselves, and
    /// are flushing before tearing down.
    ClientException,

    /// Client close handshake finished.
    ClientClosed,
}

fn slot_remove(inner: &mut Inner, channel_id: u16) -> Result<ChannelSlot> {
    inner
        .chan_slots
        .remove(channel_id)
        .ok_or_else(|| ReceivedFrameWithBogusChannelIdSnafu { channel_id }.build())
}

fn slot_get_mut(inner: &mut Inner, channel_id: u16) -> Result<&mut ChannelSlot> {
    inner
        .chan_slots
        .get_mut(channel_id)
        .ok_or_else(|| ReceivedFrameWithBogusChannelIdSnafu { channel_id }.build())
}

fn send<T: Send + Sync + 'static>(tx: &crossbeam_channel::Sender<T>, item: T) -> Result<()> {
    tx.send(item)
        .map_err(|_| EventLoopClientDroppedSnafu.build())
}

impl ConnectionState {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AmqpFrame) -> Result<()> {
        // bail out if we shouldn't be getting frames
        match self {
            ConnectionState::Steady(_) => (),
            ConnectionState::ServerClosing(_)
            | ConnectionState::ClientClosed
            | ConnectionState::ClientException => return FrameUnexpectedSnafu.fail(),
        }

        // Frames for channels we are unilaterally closing are discarded
        // until their close-ok arrives.
        let channel_id = frame.channel_id();
        if channel_id != 0 && inner.closing_channels.contains(&channel_id) {
            match &frame {
                AmqpFrame::Method(_, AmqpClass::Channel(channel::Method::CloseOk(_))) => {
                    inner.closing_channels.swap_remove(&channel_id);
                }
                other => trace!("discarding frame for closing channel: {:?}", other),
            }
            return Ok(());
        }

        match frame {
            AmqpFrame::Heartbeat(0) => {
                // read activity was already recorded at the socket layer
                trace!("received heartbeat");
                Ok(())
            }
            AmqpFrame::Heartbeat(n) => self.client_exception(
                inner,
                FRAME_ERROR,
                format!("received heartbeat frame on channel {}", n),
            ),
            AmqpFrame::Method(0, AmqpClass::Connection(method)) => {
                self.process_channel0(inner, method)
            }
            AmqpFrame::Method(0, other) => self.client_exception(
                inner,
                NOT_IMPLEMENTED,
                format!("do not know how to handle channel 0 method {:?}", other),
            ),
            AmqpFrame::Header(0, _) | AmqpFrame::Body(0, _) => self.client_exception(
                inner,
                NOT_ALLOWED,
                "received illegal channel 0 content frame".to_string(),
            ),
            AmqpFrame::Method(n, _) | AmqpFrame::Header(n, _) | AmqpFrame::Body(n, _)
                if inner.chan_slots.get(n).is_none() =>
            {
                self.client_exception(
                    inner,
                    UNEXPECTED_FRAME,
                    format!("received frame for unknown channel {}", n),
                )
            }
            AmqpFrame::Method(n, method) => self.process_channel_method(inner, n, method),
            AmqpFrame::Header(n, header) => {
                let slot = slot_get_mut(inner, n)?;
                match slot.collector.collect_header(*header)? {
                    Some(done) => Self::route_content(inner, n, done),
                    None => Ok(()),
                }
            }
            AmqpFrame::Body(n, body) => {
                let slot = slot_get_mut(inner, n)?;
                match slot.collector.collect_body(body)? {
                    Some(done) => Self::route_content(inner, n, done),
                    None => Ok(()),
                }
            }
        }
    }

    fn process_channel0(&mut self, inner: &mut Inner, method: connection::Method) -> Result<()> {
        match method {
            connection::Method::Close(close) => {
                inner.push_method(0, connection::Method::CloseOk(connection::CloseOk {}))?;
                inner.seal_writes();
                *self = ConnectionState::ServerClosing(close);
                Ok(())
            }
            connection::Method::CloseOk(close_ok) => {
                let ch0 = match self {
                    ConnectionState::Steady(ch0) => ch0,
                    _ => unreachable!("close-ok only reachable in steady state"),
                };
                send(
                    &ch0.common.tx,
                    Ok(ChannelMessage::Method(AmqpClass::Connection(
                        connection::Method::CloseOk(close_ok),
                    ))),
                )?;
                *self = ConnectionState::ClientClosed;
                Ok(())
            }
            connection::Method::Blocked(blocked) => {
                warn!("server blocked connection (reason = {})", blocked.reason);
                inner
                    .blocked_listeners
                    .broadcast(ConnectionBlockedNotification::Blocked(blocked.reason));
                Ok(())
            }
            connection::Method::Unblocked(_) => {
                warn!("server unblocked connection");
                inner
                    .blocked_listeners
                    .broadcast(ConnectionBlockedNotification::Unblocked);
                Ok(())
            }
            other => self.client_exception(
                inner,
                NOT_IMPLEMENTED,
                format!("do not know how to handle channel 0 method {:?}", other),
            ),
        }
    }

    fn process_channel_method(
        &mut self,
        inner: &mut Inner,
        n: u16,
        method: AmqpClass,
    ) -> Result<()> {
        // A method frame while a content sequence is mid-flight is a
        // framing error (content must be contiguous per channel).
        {
            let slot = slot_get_mut(inner, n)?;
            if slot.collector.mid_content() {
                return self.client_exception(
                    inner,
                    FRAME_ERROR,
                    format!("method frame interleaved with content on channel {}", n),
                );
            }
        }

        match method {
            AmqpClass::Channel(channel::Method::Close(close)) => {
                let slot = slot_remove(inner, n)?;
                warn!("server closing channel {}: {:?}", n, close);
                if let Some(tracker) = &slot.confirm_tracker {
                    if tracker.outstanding() > 0 {
                        warn!(
                            "channel {} closed with {} unconfirmed publishes",
                            n,
                            tracker.outstanding()
                        );
                    }
                }
                inner.push_method(n, channel::Method::CloseOk(channel::CloseOk {}))?;
                let err = Error::ServerClosedChannel {
                    channel_id: n,
                    code: close.reply_code,
                    message: close.reply_text,
                    class_id: close.class_id,
                    method_id: close.method_id,
                };
                for (_, consumer_tx) in slot.consumers.iter() {
                    let _ = consumer_tx.send(ConsumerMessage::ServerClosedChannel(err.clone()));
                }
                // dropping the slot's confirm tracker interrupts all
                // outstanding confirm handles
                send(&slot.tx, Err(err))
            }
            AmqpClass::Channel(channel::Method::CloseOk(close_ok)) => {
                let slot = slot_remove(inner, n)?;
                for (_, consumer_tx) in slot.consumers.iter() {
                    let _ = consumer_tx.send(ConsumerMessage::ClientClosedChannel);
                }
                send(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AmqpClass::Channel(
                        channel::Method::CloseOk(close_ok),
                    ))),
                )
            }
            AmqpClass::Channel(channel::Method::Flow(flow)) => {
                // honor the server's pause/resume request and mirror it back
                let slot = slot_get_mut(inner, n)?;
                slot.flow_active = flow.active;
                warn!(
                    "server {} channel {}",
                    if flow.active { "resumed" } else { "paused" },
                    n
                );
                inner.push_method(
                    n,
                    channel::Method::FlowOk(channel::FlowOk {
                        active: flow.active,
                    }),
                )?;
                Ok(())
            }
            AmqpClass::Basic(basic::Method::ConsumeOk(consume_ok)) => {
                let consumer_tag = consume_ok.consumer_tag;
                let slot = slot_get_mut(inner, n)?;
                let sink = match slot.pending_consumer.take() {
                    Some(sink) => sink,
                    None => return FrameUnexpectedSnafu.fail(),
                };
                match slot.consumers.entry(consumer_tag.clone()) {
                    Entry::Occupied(_) => DuplicateConsumerTagSnafu {
                        channel_id: n,
                        consumer_tag,
                    }
                    .fail(),
                    Entry::Vacant(entry) => {
                        entry.insert(sink);
                        send(&slot.tx, Ok(ChannelMessage::ConsumeOk(consumer_tag)))
                    }
                }
            }
            AmqpClass::Basic(basic::Method::CancelOk(cancel_ok)) => {
                let slot = slot_get_mut(inner, n)?;
                if let Some(consumer_tx) = slot.consumers.shift_remove(&cancel_ok.consumer_tag) {
                    let _ = consumer_tx.send(ConsumerMessage::ClientCancelled);
                }
                send(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AmqpClass::Basic(
                        basic::Method::CancelOk(cancel_ok),
                    ))),
                )
            }
            AmqpClass::Basic(basic::Method::Cancel(cancel)) => {
                // server-initiated cancel, e.g. the queue was deleted
                warn!(
                    "server cancelled consumer {} on channel {}",
                    cancel.consumer_tag, n
                );
                let nowait = cancel.nowait;
                let slot = slot_get_mut(inner, n)?;
                if let Some(consumer_tx) = slot.consumers.shift_remove(&cancel.consumer_tag) {
                    let _ = consumer_tx.send(ConsumerMessage::ServerCancelled);
                }
                if !nowait {
                    inner.push_method(
                        n,
                        basic::Method::CancelOk(basic::CancelOk {
                            consumer_tag: cancel.consumer_tag,
                        }),
                    )?;
                }
                Ok(())
            }
            AmqpClass::Basic(basic::Method::Deliver(deliver)) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_deliver(deliver)
            }
            AmqpClass::Basic(basic::Method::Return(return_)) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_return(return_)
            }
            AmqpClass::Basic(basic::Method::GetOk(get_ok)) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_get(get_ok)
            }
            AmqpClass::Basic(basic::Method::GetEmpty(_)) => {
                let slot = slot_get_mut(inner, n)?;
                send(&slot.tx, Ok(ChannelMessage::GetOk(Box::new(None))))
            }
            AmqpClass::Basic(basic::Method::Ack(ack)) => {
                Self::process_confirm(inner, n, ack.delivery_tag, ack.multiple, true)
            }
            AmqpClass::Basic(basic::Method::Nack(nack)) => {
                Self::process_confirm(inner, n, nack.delivery_tag, nack.multiple, false)
            }
            method => {
                let slot = slot_get_mut(inner, n)?;
                trace!(
                    "forwarding method to RPC slot for channel {}: {:?}",
                    n,
                    method
                );
                send(&slot.tx, Ok(ChannelMessage::Method(method)))
            }
        }
    }

    /// Publisher confirm from the server: resolve tracked sequences, then
    /// forward the raw event to the channel's confirm listener if one is
    /// registered.
    fn process_confirm(
        inner: &mut Inner,
        n: u16,
        delivery_tag: u64,
        multiple: bool,
        is_ack: bool,
    ) -> Result<()> {
        let slot = slot_get_mut(inner, n)?;
        let tracker = match slot.confirm_tracker.as_mut() {
            Some(tracker) => tracker,
            // an ack on a channel that never ran confirm.select
            None => return FrameUnexpectedSnafu.fail(),
        };
        tracker.resolve(delivery_tag, multiple, is_ack);

        if let Some(handler) = &slot.confirm_handler {
            let payload = ConfirmPayload {
                delivery_tag,
                multiple,
            };
            let confirm = if is_ack {
                Confirm::Ack(payload)
            } else {
                Confirm::Nack(payload)
            };
            if handler.send(confirm).is_err() {
                trace!("dropping confirm listener for channel {} (receiver gone)", n);
                slot.confirm_handler = None;
            }
        }
        Ok(())
    }

    fn route_content(inner: &mut Inner, n: u16, done: CollectorResult) -> Result<()> {
        match done {
            CollectorResult::Delivery((consumer_tag, delivery)) => {
                let slot = slot_get_mut(inner, n)?;
                match slot.consumers.get(&consumer_tag) {
                    Some(consumer_tx) => {
                        if consumer_tx
                            .send(ConsumerMessage::Delivery(delivery))
                            .is_err()
                        {
                            // consumer receiver dropped without a cancel;
                            // stop routing to it
                            warn!(
                                "dropping consumer {} on channel {} (receiver gone)",
                                consumer_tag, n
                            );
                            slot.consumers.shift_remove(&consumer_tag);
                        }
                        Ok(())
                    }
                    None => {
                        // delivery for a tag we never registered; the
                        // channel is compromised, so close it with a
                        // protocol error (the connection survives)
                        let err = UnknownConsumerTagSnafu {
                            channel_id: n,
                            consumer_tag: consumer_tag.clone(),
                        }
                        .build();
                        error!("{} - closing channel", err);
                        let slot = slot_remove(inner, n)?;
                        for (_, consumer_tx) in slot.consumers.iter() {
                            let _ = consumer_tx
                                .send(ConsumerMessage::ServerClosedChannel(err.clone()));
                        }
                        let _ = slot.tx.send(Err(err));
                        inner.push_method(
                            n,
                            channel::Method::Close(channel::Close {
                                reply_code: UNEXPECTED_FRAME,
                                reply_text: clip_shortstr(format!(
                                    "unknown consumer tag {}",
                                    consumer_tag
                                )),
                                class_id: CLASS_BASIC,
                                method_id: 60,
                            }),
                        )?;
                        inner.closing_channels.insert(n);
                        Ok(())
                    }
                }
            }
            CollectorResult::Return(return_) => {
                let slot = slot_get_mut(inner, n)?;
                match &slot.return_handler {
                    Some(handler) => {
                        if handler.send(return_).is_err() {
                            trace!("dropping return listener for channel {} (receiver gone)", n);
                            slot.return_handler = None;
                        }
                    }
                    None => warn!("discarding returned message on channel {} (no listener)", n),
                }
                Ok(())
            }
            CollectorResult::Get(get) => {
                let slot = slot_get_mut(inner, n)?;
                send(&slot.tx, Ok(ChannelMessage::GetOk(Box::new(Some(get)))))
            }
        }
    }

    /// Protocol violation on our side of the conversation: send
    /// connection.close with a hard error code, stop accepting writes, and
    /// flush before tearing down. The text is ours (it may embed a method
    /// dump of unbounded size), so it is clipped to the short-string limit
    /// rather than erroring.
    fn client_exception(&mut self, inner: &mut Inner, reply_code: u16, text: String) -> Result<()> {
        error!("{} - closing connection", text);
        let close = connection::Close {
            reply_code,
            reply_text: clip_shortstr(text),
            class_id: 0,
            method_id: 0,
        };
        inner.push_method(0, connection::Method::Close(close))?;
        inner.seal_writes();
        *self = ConnectionState::ClientException;
        Ok(())
    }
}
