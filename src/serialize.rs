use crate::errors::*;
use crate::wire::constants::{FRAME_OVERHEAD, PROTOCOL_HEADER};
use crate::wire::frame::{
    encode_content_body_frame, encode_content_header_frame, encode_heartbeat_frame,
    encode_method_frame,
};
use crate::wire::method::{basic, channel, confirm, connection, exchange, queue};
use crate::wire::{AmqpClass, AmqpProperties};
use std::ops::{Index, RangeFrom};

/// Conversion from a per-class method enum into the generic [`AmqpClass`];
/// lets callers push typed methods without spelling the class wrapper.
pub trait IntoAmqpClass {
    fn into_class(self) -> AmqpClass;
}

macro_rules! impl_into_class {
    ($module:ident, $variant:ident) => {
        impl IntoAmqpClass for $module::Method {
            fn into_class(self) -> AmqpClass {
                AmqpClass::$variant(self)
            }
        }
    };
}

impl_into_class!(connection, Connection);
impl_into_class!(channel, Channel);
impl_into_class!(exchange, Exchange);
impl_into_class!(queue, Queue);
impl_into_class!(basic, Basic);
impl_into_class!(confirm, Confirm);

/// Extraction of a typed RPC reply from a decoded method; any other method
/// is an unexpected frame.
pub trait TryFromAmqpClass: Sized {
    fn try_from(class: AmqpClass) -> Result<Self>;
}

macro_rules! impl_try_from_class {
    ($class_variant:ident, $module:ident, $method:ident) => {
        impl TryFromAmqpClass for $module::$method {
            fn try_from(class: AmqpClass) -> Result<Self> {
                match class {
                    AmqpClass::$class_variant($module::Method::$method(inner)) => Ok(inner),
                    _ => FrameUnexpectedSnafu.fail(),
                }
            }
        }
    };
}

impl_try_from_class!(Connection, connection, CloseOk);
impl_try_from_class!(Channel, channel, OpenOk);
impl_try_from_class!(Channel, channel, CloseOk);
impl_try_from_class!(Channel, channel, FlowOk);
impl_try_from_class!(Exchange, exchange, DeclareOk);
impl_try_from_class!(Exchange, exchange, DeleteOk);
impl_try_from_class!(Exchange, exchange, BindOk);
impl_try_from_class!(Exchange, exchange, UnbindOk);
impl_try_from_class!(Queue, queue, DeclareOk);
impl_try_from_class!(Queue, queue, BindOk);
impl_try_from_class!(Queue, queue, UnbindOk);
impl_try_from_class!(Queue, queue, PurgeOk);
impl_try_from_class!(Queue, queue, DeleteOk);
impl_try_from_class!(Basic, basic, QosOk);
impl_try_from_class!(Basic, basic, CancelOk);
impl_try_from_class!(Confirm, confirm, SelectOk);

/// Serialized outbound frames. May hold multiple frames; the I/O thread
/// appends these into its single write buffer, so frames from one buffer
/// hit the wire contiguously.
#[derive(Clone)]
pub struct OutputBuffer(Vec<u8>);

impl OutputBuffer {
    pub fn with_protocol_header() -> OutputBuffer {
        OutputBuffer(PROTOCOL_HEADER.to_vec())
    }

    pub fn empty() -> OutputBuffer {
        OutputBuffer(Vec::new())
    }

    /// Append a method frame. Fails (leaving the buffer untouched) if a
    /// short-string argument exceeds the 255-byte protocol limit.
    pub fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        encode_method_frame(&mut self.0, channel_id, &method.into_class())
            .map_err(|err| ShortStringTooLongSnafu { length: err.length }.build())
    }

    pub fn push_heartbeat(&mut self) {
        encode_heartbeat_frame(&mut self.0);
    }

    pub fn push_content_header(
        &mut self,
        channel_id: u16,
        class_id: u16,
        body_size: usize,
        properties: &AmqpProperties,
    ) -> Result<()> {
        encode_content_header_frame(&mut self.0, channel_id, class_id, body_size as u64, properties)
            .map_err(|err| ShortStringTooLongSnafu { length: err.length }.build())
    }

    /// Append body frames for `content`, fragmented so no frame exceeds the
    /// negotiated frame-max (body chunks of at most `frame_max - 8` to
    /// leave room for the generic frame overhead).
    pub fn push_content_body(&mut self, channel_id: u16, content: &[u8], frame_max: usize) {
        debug_assert!(frame_max > FRAME_OVERHEAD);
        let max_chunk = frame_max - FRAME_OVERHEAD;
        for chunk in content.chunks(max_chunk) {
            encode_content_body_frame(&mut self.0, channel_id, chunk);
        }
    }

    /// Move the accumulated bytes out, leaving `self` empty and reusable.
    pub fn drain_into_new_buf(&mut self) -> OutputBuffer {
        let mut new_buf = OutputBuffer::empty();
        std::mem::swap(self, &mut new_buf);
        new_buf
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0.clear()
    }

    #[inline]
    pub fn drain_written(&mut self, n: usize) {
        self.0.drain(0..n);
    }

    #[inline]
    pub fn append(&mut self, mut other: OutputBuffer) {
        self.0.append(&mut other.0)
    }
}

impl Index<RangeFrom<usize>> for OutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.0[index]
    }
}

/// An output buffer that can be sealed once a connection close (or
/// close-ok) has been appended; anything pushed after sealing is silently
/// discarded so nothing follows the close on the wire.
pub struct SealableOutputBuffer {
    buf: OutputBuffer,
    sealed: bool,
}

impl SealableOutputBuffer {
    pub fn new(buf: OutputBuffer) -> SealableOutputBuffer {
        SealableOutputBuffer { buf, sealed: false }
    }

    #[inline]
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        if !self.sealed {
            self.buf.push_method(channel_id, method)?;
        }
        Ok(())
    }

    pub fn push_heartbeat(&mut self) {
        if !self.sealed {
            self.buf.push_heartbeat();
        }
    }

    pub fn append(&mut self, other: OutputBuffer) {
        if !self.sealed {
            self.buf.append(other);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear()
    }

    #[inline]
    pub fn drain_written(&mut self, n: usize) {
        self.buf.drain_written(n)
    }
}

impl Index<RangeFrom<usize>> for SealableOutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.buf[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::constants::FRAME_END;
    use crate::wire::AmqpFrame;

    fn parse_all(mut bytes: &[u8]) -> Vec<AmqpFrame> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let size = AmqpFrame::parse_size(bytes).unwrap();
            frames.push(AmqpFrame::parse(&bytes[..size]).unwrap());
            bytes = &bytes[size..];
        }
        frames
    }

    #[test]
    fn protocol_header_prefix() {
        let buf = OutputBuffer::with_protocol_header();
        assert_eq!(&buf[0..], b"AMQP\x00\x00\x09\x01");
    }

    #[test]
    fn body_fragmentation_respects_frame_max() {
        let frame_max = 16; // 8 bytes of body per frame
        let content = vec![7u8; 20];

        let mut buf = OutputBuffer::empty();
        buf.push_content_body(3, &content, frame_max);

        let frames = parse_all(&buf[0..]);
        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| match f {
                AmqpFrame::Body(3, body) => body.len(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![8, 8, 4]);
    }

    #[test]
    fn body_of_exactly_one_fragment_is_single_frame() {
        let frame_max = 16;
        let content = vec![7u8; 8];

        let mut buf = OutputBuffer::empty();
        buf.push_content_body(1, &content, frame_max);

        let frames = parse_all(&buf[0..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(buf.len(), frame_max);
        assert_eq!(buf[0..].last(), Some(&FRAME_END));
    }

    #[test]
    fn sealed_buffer_discards_pushes() {
        use crate::wire::method::connection::{self as conn, CloseOk};

        let mut buf = SealableOutputBuffer::new(OutputBuffer::empty());
        buf.push_method(0, conn::Method::CloseOk(CloseOk {})).unwrap();
        let len_after_close = buf.len();
        buf.seal();
        buf.push_heartbeat();
        assert_eq!(buf.len(), len_after_close);
    }

    #[test]
    fn overlong_name_fails_loudly_and_leaves_buffer_clean() {
        use crate::errors::Error;
        use crate::wire::method::basic;

        let mut buf = OutputBuffer::empty();
        let err = buf
            .push_method(
                1,
                basic::Method::Publish(basic::Publish {
                    ticket: 0,
                    exchange: String::new(),
                    routing_key: "k".repeat(256),
                    mandatory: false,
                    immediate: false,
                }),
            )
            .unwrap_err();
        match err {
            Error::ShortStringTooLong { length: 256 } => (),
            other => panic!("unexpected error {}", other),
        }
        assert!(buf.is_empty());
    }
}
