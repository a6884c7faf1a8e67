//! Frame-level encoding and decoding.
//!
//! A frame is `type(1) channel(2) size(4) payload(size) 0xCE`. The size
//! field covers only the payload. Content bodies are fragmented by the
//! caller so that every frame fits within the negotiated frame-max.

use super::constants::*;
use super::method::AmqpClass;
use super::properties::AmqpProperties;
use super::types::{Cursor, DecodeError, DecodeResult, EncodeResult};

/// The content-header payload following a content-bearing method.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: AmqpProperties,
}

/// One decoded frame, as routed by the method dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpFrame {
    Method(u16, AmqpClass),
    Header(u16, Box<ContentHeader>),
    Body(u16, Vec<u8>),
    Heartbeat(u16),
}

impl AmqpFrame {
    pub fn channel_id(&self) -> u16 {
        match self {
            AmqpFrame::Method(id, _)
            | AmqpFrame::Header(id, _)
            | AmqpFrame::Body(id, _)
            | AmqpFrame::Heartbeat(id) => *id,
        }
    }

    /// Parse one complete frame. `buf` must hold exactly the frame: header,
    /// payload, and end octet; the caller learns the length from
    /// [`parse_size`].
    pub fn parse(buf: &[u8]) -> DecodeResult<AmqpFrame> {
        let mut c = Cursor::new(buf);
        let frame_type = c.take_u8()?;
        let channel_id = c.take_u16()?;
        let size = c.take_u32()? as usize;
        let payload = c.take_bytes(size)?;
        let end = c.take_u8()?;
        if end != FRAME_END {
            return Err(DecodeError("bad frame-end octet"));
        }
        if c.remaining() != 0 {
            return Err(DecodeError("trailing bytes after frame"));
        }

        let mut p = Cursor::new(payload);
        let frame = match frame_type {
            FRAME_METHOD => {
                let class = AmqpClass::decode(&mut p)?;
                if p.remaining() != 0 {
                    return Err(DecodeError("trailing bytes after method arguments"));
                }
                AmqpFrame::Method(channel_id, class)
            }
            FRAME_HEADER => {
                let class_id = p.take_u16()?;
                let _weight = p.take_u16()?;
                let body_size = p.take_u64()?;
                let properties = AmqpProperties::decode(&mut p)?;
                if p.remaining() != 0 {
                    return Err(DecodeError("trailing bytes after content header"));
                }
                AmqpFrame::Header(
                    channel_id,
                    Box::new(ContentHeader {
                        class_id,
                        body_size,
                        properties,
                    }),
                )
            }
            FRAME_BODY => AmqpFrame::Body(channel_id, payload.to_vec()),
            FRAME_HEARTBEAT => {
                if !payload.is_empty() {
                    return Err(DecodeError("heartbeat frame with payload"));
                }
                AmqpFrame::Heartbeat(channel_id)
            }
            _ => return Err(DecodeError("unknown frame type")),
        };
        Ok(frame)
    }

    /// How many bytes the next frame needs, if the 7-byte header has
    /// arrived yet.
    pub fn parse_size(buf: &[u8]) -> Option<usize> {
        if buf.len() < FRAME_HEADER_SIZE {
            None
        } else {
            let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
            Some(size as usize + FRAME_OVERHEAD)
        }
    }
}

fn frame_preamble(buf: &mut Vec<u8>, frame_type: u8, channel_id: u16) -> usize {
    buf.push(frame_type);
    buf.extend_from_slice(&channel_id.to_be_bytes());
    buf.extend_from_slice(&[0; 4]);
    buf.len()
}

fn backpatch_size(buf: &mut Vec<u8>, payload_start: usize) {
    let size = (buf.len() - payload_start) as u32;
    buf[payload_start - 4..payload_start].copy_from_slice(&size.to_be_bytes());
    buf.push(FRAME_END);
}

/// Encode a method frame. On an encode error (over-long short string) the
/// buffer is rolled back to its pre-call length so no partial frame
/// reaches the wire.
pub fn encode_method_frame(buf: &mut Vec<u8>, channel_id: u16, class: &AmqpClass) -> EncodeResult {
    let frame_start = buf.len();
    let payload_start = frame_preamble(buf, FRAME_METHOD, channel_id);
    match class.encode(buf) {
        Ok(()) => {
            backpatch_size(buf, payload_start);
            Ok(())
        }
        Err(err) => {
            buf.truncate(frame_start);
            Err(err)
        }
    }
}

/// Encode a content-header frame; rolls back like [`encode_method_frame`]
/// when a property fails to encode.
pub fn encode_content_header_frame(
    buf: &mut Vec<u8>,
    channel_id: u16,
    class_id: u16,
    body_size: u64,
    properties: &AmqpProperties,
) -> EncodeResult {
    let frame_start = buf.len();
    let payload_start = frame_preamble(buf, FRAME_HEADER, channel_id);
    buf.extend_from_slice(&class_id.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // weight, reserved
    buf.extend_from_slice(&body_size.to_be_bytes());
    match properties.encode(buf) {
        Ok(()) => {
            backpatch_size(buf, payload_start);
            Ok(())
        }
        Err(err) => {
            buf.truncate(frame_start);
            Err(err)
        }
    }
}

pub fn encode_content_body_frame(buf: &mut Vec<u8>, channel_id: u16, body: &[u8]) {
    let start = frame_preamble(buf, FRAME_BODY, channel_id);
    buf.extend_from_slice(body);
    backpatch_size(buf, start);
}

pub fn encode_heartbeat_frame(buf: &mut Vec<u8>) {
    let start = frame_preamble(buf, FRAME_HEARTBEAT, 0);
    backpatch_size(buf, start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::method::{basic, channel};

    #[test]
    fn heartbeat_is_eight_bytes() {
        let mut buf = Vec::new();
        encode_heartbeat_frame(&mut buf);
        assert_eq!(buf, vec![8, 0, 0, 0, 0, 0, 0, 0xCE]);
        assert_eq!(AmqpFrame::parse(&buf).unwrap(), AmqpFrame::Heartbeat(0));
    }

    #[test]
    fn method_frame_roundtrip() {
        let class = AmqpClass::Channel(channel::Method::Open(channel::Open {
            out_of_band: String::new(),
        }));
        let mut buf = Vec::new();
        encode_method_frame(&mut buf, 3, &class).unwrap();
        assert_eq!(AmqpFrame::parse_size(&buf), Some(buf.len()));
        assert_eq!(AmqpFrame::parse(&buf).unwrap(), AmqpFrame::Method(3, class));
    }

    #[test]
    fn failed_encode_rolls_the_buffer_back() {
        use crate::wire::method::queue;
        use crate::wire::FieldTable;

        let mut buf = Vec::new();
        encode_heartbeat_frame(&mut buf);
        let len_before = buf.len();

        let class = AmqpClass::Queue(queue::Method::Declare(queue::Declare {
            ticket: 0,
            queue: "q".repeat(256),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            nowait: false,
            arguments: FieldTable::new(),
        }));
        assert!(encode_method_frame(&mut buf, 1, &class).is_err());
        assert_eq!(buf.len(), len_before);
    }

    #[test]
    fn content_header_roundtrip() {
        let properties = AmqpProperties::default().with_delivery_mode(2);
        let mut buf = Vec::new();
        encode_content_header_frame(&mut buf, 1, 60, 1024, &properties).unwrap();
        match AmqpFrame::parse(&buf).unwrap() {
            AmqpFrame::Header(1, header) => {
                assert_eq!(header.class_id, 60);
                assert_eq!(header.body_size, 1024);
                assert_eq!(header.properties, properties);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn body_frame_roundtrip() {
        let mut buf = Vec::new();
        encode_content_body_frame(&mut buf, 9, b"hello");
        assert_eq!(
            AmqpFrame::parse(&buf).unwrap(),
            AmqpFrame::Body(9, b"hello".to_vec())
        );
    }

    #[test]
    fn bad_end_octet_is_a_framing_error() {
        let class = AmqpClass::Basic(basic::Method::Ack(basic::Ack {
            delivery_tag: 1,
            multiple: false,
        }));
        let mut buf = Vec::new();
        encode_method_frame(&mut buf, 1, &class).unwrap();
        *buf.last_mut().unwrap() = 0xCD;
        assert_eq!(
            AmqpFrame::parse(&buf).unwrap_err(),
            DecodeError("bad frame-end octet")
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let buf = [9u8, 0, 0, 0, 0, 0, 0, 0xCE];
        assert!(AmqpFrame::parse(&buf).is_err());
    }
}
