//! Method encoding and decoding for the classes this client speaks:
//! connection, channel, exchange, queue, basic, and confirm.
//!
//! Method arguments are packed positionally per the protocol grammar;
//! consecutive boolean arguments share bit positions within one octet.

use super::constants::*;
use super::types::{
    encode_longstr, encode_shortstr, Cursor, DecodeError, DecodeResult, EncodeResult, FieldTable,
};

/// A decoded method frame payload: which class it belongs to and the
/// method's arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpClass {
    Connection(connection::Method),
    Channel(channel::Method),
    Exchange(exchange::Method),
    Queue(queue::Method),
    Basic(basic::Method),
    Confirm(confirm::Method),
}

impl AmqpClass {
    /// The `(class_id, method_id)` pair, as carried in close replies.
    pub fn ids(&self) -> (u16, u16) {
        match self {
            AmqpClass::Connection(m) => (CLASS_CONNECTION, m.method_id()),
            AmqpClass::Channel(m) => (CLASS_CHANNEL, m.method_id()),
            AmqpClass::Exchange(m) => (CLASS_EXCHANGE, m.method_id()),
            AmqpClass::Queue(m) => (CLASS_QUEUE, m.method_id()),
            AmqpClass::Basic(m) => (CLASS_BASIC, m.method_id()),
            AmqpClass::Confirm(m) => (CLASS_CONFIRM, m.method_id()),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> EncodeResult {
        let (class_id, method_id) = self.ids();
        buf.extend_from_slice(&class_id.to_be_bytes());
        buf.extend_from_slice(&method_id.to_be_bytes());
        match self {
            AmqpClass::Connection(m) => m.encode_args(buf),
            AmqpClass::Channel(m) => m.encode_args(buf),
            AmqpClass::Exchange(m) => m.encode_args(buf),
            AmqpClass::Queue(m) => m.encode_args(buf),
            AmqpClass::Basic(m) => m.encode_args(buf),
            AmqpClass::Confirm(m) => m.encode_args(buf),
        }
    }

    pub fn decode(cursor: &mut Cursor<'_>) -> DecodeResult<AmqpClass> {
        let class_id = cursor.take_u16()?;
        let method_id = cursor.take_u16()?;
        match class_id {
            CLASS_CONNECTION => Ok(AmqpClass::Connection(connection::Method::decode_args(
                method_id, cursor,
            )?)),
            CLASS_CHANNEL => Ok(AmqpClass::Channel(channel::Method::decode_args(
                method_id, cursor,
            )?)),
            CLASS_EXCHANGE => Ok(AmqpClass::Exchange(exchange::Method::decode_args(
                method_id, cursor,
            )?)),
            CLASS_QUEUE => Ok(AmqpClass::Queue(queue::Method::decode_args(
                method_id, cursor,
            )?)),
            CLASS_BASIC => Ok(AmqpClass::Basic(basic::Method::decode_args(
                method_id, cursor,
            )?)),
            CLASS_CONFIRM => Ok(AmqpClass::Confirm(confirm::Method::decode_args(
                method_id, cursor,
            )?)),
            _ => Err(DecodeError("unknown method class")),
        }
    }
}

fn bit(flags: u8, pos: u8) -> bool {
    flags & (1 << pos) != 0
}

pub mod connection {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Start {
        pub version_major: u8,
        pub version_minor: u8,
        pub server_properties: FieldTable,
        pub mechanisms: String,
        pub locales: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct StartOk {
        pub client_properties: FieldTable,
        pub mechanism: String,
        pub response: String,
        pub locale: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Secure {
        pub challenge: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct SecureOk {
        pub response: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Tune {
        pub channel_max: u16,
        pub frame_max: u32,
        pub heartbeat: u16,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct TuneOk {
        pub channel_max: u16,
        pub frame_max: u32,
        pub heartbeat: u16,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Open {
        pub virtual_host: String,
        // "capabilities" and "insist" are reserved in 0-9-1
        pub capabilities: String,
        pub insist: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct OpenOk {
        pub known_hosts: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Close {
        pub reply_code: u16,
        pub reply_text: String,
        pub class_id: u16,
        pub method_id: u16,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct CloseOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub struct Blocked {
        pub reason: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Unblocked {}

    #[derive(Debug, Clone, PartialEq)]
    pub enum Method {
        Start(Start),
        StartOk(StartOk),
        Secure(Secure),
        SecureOk(SecureOk),
        Tune(Tune),
        TuneOk(TuneOk),
        Open(Open),
        OpenOk(OpenOk),
        Close(Close),
        CloseOk(CloseOk),
        Blocked(Blocked),
        Unblocked(Unblocked),
    }

    impl Method {
        pub(super) fn method_id(&self) -> u16 {
            match self {
                Method::Start(_) => 10,
                Method::StartOk(_) => 11,
                Method::Secure(_) => 20,
                Method::SecureOk(_) => 21,
                Method::Tune(_) => 30,
                Method::TuneOk(_) => 31,
                Method::Open(_) => 40,
                Method::OpenOk(_) => 41,
                Method::Close(_) => 50,
                Method::CloseOk(_) => 51,
                Method::Blocked(_) => 60,
                Method::Unblocked(_) => 61,
            }
        }

        pub(super) fn encode_args(&self, buf: &mut Vec<u8>) -> EncodeResult {
            match self {
                Method::Start(m) => {
                    buf.push(m.version_major);
                    buf.push(m.version_minor);
                    m.server_properties.encode(buf)?;
                    encode_longstr(buf, m.mechanisms.as_bytes());
                    encode_longstr(buf, m.locales.as_bytes());
                }
                Method::StartOk(m) => {
                    m.client_properties.encode(buf)?;
                    encode_shortstr(buf, &m.mechanism)?;
                    encode_longstr(buf, m.response.as_bytes());
                    encode_shortstr(buf, &m.locale)?;
                }
                Method::Secure(m) => encode_longstr(buf, m.challenge.as_bytes()),
                Method::SecureOk(m) => encode_longstr(buf, m.response.as_bytes()),
                Method::Tune(m) => {
                    buf.extend_from_slice(&m.channel_max.to_be_bytes());
                    buf.extend_from_slice(&m.frame_max.to_be_bytes());
                    buf.extend_from_slice(&m.heartbeat.to_be_bytes());
                }
                Method::TuneOk(m) => {
                    buf.extend_from_slice(&m.channel_max.to_be_bytes());
                    buf.extend_from_slice(&m.frame_max.to_be_bytes());
                    buf.extend_from_slice(&m.heartbeat.to_be_bytes());
                }
                Method::Open(m) => {
                    encode_shortstr(buf, &m.virtual_host)?;
                    encode_shortstr(buf, &m.capabilities)?;
                    buf.push(m.insist as u8);
                }
                Method::OpenOk(m) => encode_shortstr(buf, &m.known_hosts)?,
                Method::Close(m) => {
                    buf.extend_from_slice(&m.reply_code.to_be_bytes());
                    encode_shortstr(buf, &m.reply_text)?;
                    buf.extend_from_slice(&m.class_id.to_be_bytes());
                    buf.extend_from_slice(&m.method_id.to_be_bytes());
                }
                Method::CloseOk(_) | Method::Unblocked(_) => (),
                Method::Blocked(m) => encode_shortstr(buf, &m.reason)?,
            }
            Ok(())
        }

        pub(super) fn decode_args(method_id: u16, c: &mut Cursor<'_>) -> DecodeResult<Method> {
            Ok(match method_id {
                10 => Method::Start(Start {
                    version_major: c.take_u8()?,
                    version_minor: c.take_u8()?,
                    server_properties: c.take_table()?,
                    mechanisms: c.take_longstr()?,
                    locales: c.take_longstr()?,
                }),
                11 => Method::StartOk(StartOk {
                    client_properties: c.take_table()?,
                    mechanism: c.take_shortstr()?,
                    response: c.take_longstr()?,
                    locale: c.take_shortstr()?,
                }),
                20 => Method::Secure(Secure {
                    challenge: c.take_longstr()?,
                }),
                21 => Method::SecureOk(SecureOk {
                    response: c.take_longstr()?,
                }),
                30 => Method::Tune(Tune {
                    channel_max: c.take_u16()?,
                    frame_max: c.take_u32()?,
                    heartbeat: c.take_u16()?,
                }),
                31 => Method::TuneOk(TuneOk {
                    channel_max: c.take_u16()?,
                    frame_max: c.take_u32()?,
                    heartbeat: c.take_u16()?,
                }),
                40 => Method::Open(Open {
                    virtual_host: c.take_shortstr()?,
                    capabilities: c.take_shortstr()?,
                    insist: c.take_u8()? & 1 != 0,
                }),
                41 => Method::OpenOk(OpenOk {
                    known_hosts: c.take_shortstr()?,
                }),
                50 => Method::Close(Close {
                    reply_code: c.take_u16()?,
                    reply_text: c.take_shortstr()?,
                    class_id: c.take_u16()?,
                    method_id: c.take_u16()?,
                }),
                51 => Method::CloseOk(CloseOk {}),
                60 => Method::Blocked(Blocked {
                    reason: c.take_shortstr()?,
                }),
                61 => Method::Unblocked(Unblocked {}),
                _ => return Err(DecodeError("unknown connection method")),
            })
        }
    }
}

pub mod channel {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Open {
        pub out_of_band: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct OpenOk {
        pub channel_id: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Flow {
        pub active: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct FlowOk {
        pub active: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Close {
        pub reply_code: u16,
        pub reply_text: String,
        pub class_id: u16,
        pub method_id: u16,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct CloseOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub enum Method {
        Open(Open),
        OpenOk(OpenOk),
        Flow(Flow),
        FlowOk(FlowOk),
        Close(Close),
        CloseOk(CloseOk),
    }

    impl Method {
        pub(super) fn method_id(&self) -> u16 {
            match self {
                Method::Open(_) => 10,
                Method::OpenOk(_) => 11,
                Method::Flow(_) => 20,
                Method::FlowOk(_) => 21,
                Method::Close(_) => 40,
                Method::CloseOk(_) => 41,
            }
        }

        pub(super) fn encode_args(&self, buf: &mut Vec<u8>) -> EncodeResult {
            match self {
                Method::Open(m) => encode_shortstr(buf, &m.out_of_band)?,
                Method::OpenOk(m) => encode_longstr(buf, m.channel_id.as_bytes()),
                Method::Flow(m) => buf.push(m.active as u8),
                Method::FlowOk(m) => buf.push(m.active as u8),
                Method::Close(m) => {
                    buf.extend_from_slice(&m.reply_code.to_be_bytes());
                    encode_shortstr(buf, &m.reply_text)?;
                    buf.extend_from_slice(&m.class_id.to_be_bytes());
                    buf.extend_from_slice(&m.method_id.to_be_bytes());
                }
                Method::CloseOk(_) => (),
            }
            Ok(())
        }

        pub(super) fn decode_args(method_id: u16, c: &mut Cursor<'_>) -> DecodeResult<Method> {
            Ok(match method_id {
                10 => Method::Open(Open {
                    out_of_band: c.take_shortstr()?,
                }),
                11 => Method::OpenOk(OpenOk {
                    channel_id: c.take_longstr()?,
                }),
                20 => Method::Flow(Flow {
                    active: c.take_u8()? & 1 != 0,
                }),
                21 => Method::FlowOk(FlowOk {
                    active: c.take_u8()? & 1 != 0,
                }),
                40 => Method::Close(Close {
                    reply_code: c.take_u16()?,
                    reply_text: c.take_shortstr()?,
                    class_id: c.take_u16()?,
                    method_id: c.take_u16()?,
                }),
                41 => Method::CloseOk(CloseOk {}),
                _ => return Err(DecodeError("unknown channel method")),
            })
        }
    }
}

pub mod exchange {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Declare {
        pub ticket: u16,
        pub exchange: String,
        pub type_: String,
        pub passive: bool,
        pub durable: bool,
        pub auto_delete: bool,
        pub internal: bool,
        pub nowait: bool,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct DeclareOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub struct Delete {
        pub ticket: u16,
        pub exchange: String,
        pub if_unused: bool,
        pub nowait: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct DeleteOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub struct Bind {
        pub ticket: u16,
        pub destination: String,
        pub source: String,
        pub routing_key: String,
        pub nowait: bool,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct BindOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub struct Unbind {
        pub ticket: u16,
        pub destination: String,
        pub source: String,
        pub routing_key: String,
        pub nowait: bool,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct UnbindOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub enum Method {
        Declare(Declare),
        DeclareOk(DeclareOk),
        Delete(Delete),
        DeleteOk(DeleteOk),
        Bind(Bind),
        BindOk(BindOk),
        Unbind(Unbind),
        UnbindOk(UnbindOk),
    }

    impl Method {
        pub(super) fn method_id(&self) -> u16 {
            match self {
                Method::Declare(_) => 10,
                Method::DeclareOk(_) => 11,
                Method::Delete(_) => 20,
                Method::DeleteOk(_) => 21,
                Method::Bind(_) => 30,
                Method::BindOk(_) => 31,
                Method::Unbind(_) => 40,
                // 41 is skipped in the grammar; unbind-ok is 51
                Method::UnbindOk(_) => 51,
            }
        }

        pub(super) fn encode_args(&self, buf: &mut Vec<u8>) -> EncodeResult {
            match self {
                Method::Declare(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.type_)?;
                    buf.push(
                        m.passive as u8
                            | (m.durable as u8) << 1
                            | (m.auto_delete as u8) << 2
                            | (m.internal as u8) << 3
                            | (m.nowait as u8) << 4,
                    );
                    m.arguments.encode(buf)?;
                }
                Method::Delete(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.exchange)?;
                    buf.push(m.if_unused as u8 | (m.nowait as u8) << 1);
                }
                Method::Bind(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.destination)?;
                    encode_shortstr(buf, &m.source)?;
                    encode_shortstr(buf, &m.routing_key)?;
                    buf.push(m.nowait as u8);
                    m.arguments.encode(buf)?;
                }
                Method::Unbind(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.destination)?;
                    encode_shortstr(buf, &m.source)?;
                    encode_shortstr(buf, &m.routing_key)?;
                    buf.push(m.nowait as u8);
                    m.arguments.encode(buf)?;
                }
                Method::DeclareOk(_) | Method::DeleteOk(_) | Method::BindOk(_)
                | Method::UnbindOk(_) => (),
            }
            Ok(())
        }

        pub(super) fn decode_args(method_id: u16, c: &mut Cursor<'_>) -> DecodeResult<Method> {
            Ok(match method_id {
                10 => {
                    let ticket = c.take_u16()?;
                    let exchange = c.take_shortstr()?;
                    let type_ = c.take_shortstr()?;
                    let flags = c.take_u8()?;
                    Method::Declare(Declare {
                        ticket,
                        exchange,
                        type_,
                        passive: bit(flags, 0),
                        durable: bit(flags, 1),
                        auto_delete: bit(flags, 2),
                        internal: bit(flags, 3),
                        nowait: bit(flags, 4),
                        arguments: c.take_table()?,
                    })
                }
                11 => Method::DeclareOk(DeclareOk {}),
                20 => {
                    let ticket = c.take_u16()?;
                    let exchange = c.take_shortstr()?;
                    let flags = c.take_u8()?;
                    Method::Delete(Delete {
                        ticket,
                        exchange,
                        if_unused: bit(flags, 0),
                        nowait: bit(flags, 1),
                    })
                }
                21 => Method::DeleteOk(DeleteOk {}),
                30 => Method::Bind(Bind {
                    ticket: c.take_u16()?,
                    destination: c.take_shortstr()?,
                    source: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                    nowait: c.take_u8()? & 1 != 0,
                    arguments: c.take_table()?,
                }),
                31 => Method::BindOk(BindOk {}),
                40 => Method::Unbind(Unbind {
                    ticket: c.take_u16()?,
                    destination: c.take_shortstr()?,
                    source: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                    nowait: c.take_u8()? & 1 != 0,
                    arguments: c.take_table()?,
                }),
                51 => Method::UnbindOk(UnbindOk {}),
                _ => return Err(DecodeError("unknown exchange method")),
            })
        }
    }
}

pub mod queue {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Declare {
        pub ticket: u16,
        pub queue: String,
        pub passive: bool,
        pub durable: bool,
        pub exclusive: bool,
        pub auto_delete: bool,
        pub nowait: bool,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct DeclareOk {
        pub queue: String,
        pub message_count: u32,
        pub consumer_count: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Bind {
        pub ticket: u16,
        pub queue: String,
        pub exchange: String,
        pub routing_key: String,
        pub nowait: bool,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct BindOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub struct Purge {
        pub ticket: u16,
        pub queue: String,
        pub nowait: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct PurgeOk {
        pub message_count: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Delete {
        pub ticket: u16,
        pub queue: String,
        pub if_unused: bool,
        pub if_empty: bool,
        pub nowait: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct DeleteOk {
        pub message_count: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Unbind {
        pub ticket: u16,
        pub queue: String,
        pub exchange: String,
        pub routing_key: String,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct UnbindOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub enum Method {
        Declare(Declare),
        DeclareOk(DeclareOk),
        Bind(Bind),
        BindOk(BindOk),
        Purge(Purge),
        PurgeOk(PurgeOk),
        Delete(Delete),
        DeleteOk(DeleteOk),
        Unbind(Unbind),
        UnbindOk(UnbindOk),
    }

    impl Method {
        pub(super) fn method_id(&self) -> u16 {
            match self {
                Method::Declare(_) => 10,
                Method::DeclareOk(_) => 11,
                Method::Bind(_) => 20,
                Method::BindOk(_) => 21,
                Method::Purge(_) => 30,
                Method::PurgeOk(_) => 31,
                Method::Delete(_) => 40,
                Method::DeleteOk(_) => 41,
                Method::Unbind(_) => 50,
                Method::UnbindOk(_) => 51,
            }
        }

        pub(super) fn encode_args(&self, buf: &mut Vec<u8>) -> EncodeResult {
            match self {
                Method::Declare(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    buf.push(
                        m.passive as u8
                            | (m.durable as u8) << 1
                            | (m.exclusive as u8) << 2
                            | (m.auto_delete as u8) << 3
                            | (m.nowait as u8) << 4,
                    );
                    m.arguments.encode(buf)?;
                }
                Method::DeclareOk(m) => {
                    encode_shortstr(buf, &m.queue)?;
                    buf.extend_from_slice(&m.message_count.to_be_bytes());
                    buf.extend_from_slice(&m.consumer_count.to_be_bytes());
                }
                Method::Bind(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.routing_key)?;
                    buf.push(m.nowait as u8);
                    m.arguments.encode(buf)?;
                }
                Method::Purge(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    buf.push(m.nowait as u8);
                }
                Method::PurgeOk(m) => buf.extend_from_slice(&m.message_count.to_be_bytes()),
                Method::Delete(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    buf.push(m.if_unused as u8 | (m.if_empty as u8) << 1 | (m.nowait as u8) << 2);
                }
                Method::DeleteOk(m) => buf.extend_from_slice(&m.message_count.to_be_bytes()),
                Method::Unbind(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.routing_key)?;
                    m.arguments.encode(buf)?;
                }
                Method::BindOk(_) | Method::UnbindOk(_) => (),
            }
            Ok(())
        }

        pub(super) fn decode_args(method_id: u16, c: &mut Cursor<'_>) -> DecodeResult<Method> {
            Ok(match method_id {
                10 => {
                    let ticket = c.take_u16()?;
                    let queue = c.take_shortstr()?;
                    let flags = c.take_u8()?;
                    Method::Declare(Declare {
                        ticket,
                        queue,
                        passive: bit(flags, 0),
                        durable: bit(flags, 1),
                        exclusive: bit(flags, 2),
                        auto_delete: bit(flags, 3),
                        nowait: bit(flags, 4),
                        arguments: c.take_table()?,
                    })
                }
                11 => Method::DeclareOk(DeclareOk {
                    queue: c.take_shortstr()?,
                    message_count: c.take_u32()?,
                    consumer_count: c.take_u32()?,
                }),
                20 => Method::Bind(Bind {
                    ticket: c.take_u16()?,
                    queue: c.take_shortstr()?,
                    exchange: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                    nowait: c.take_u8()? & 1 != 0,
                    arguments: c.take_table()?,
                }),
                21 => Method::BindOk(BindOk {}),
                30 => Method::Purge(Purge {
                    ticket: c.take_u16()?,
                    queue: c.take_shortstr()?,
                    nowait: c.take_u8()? & 1 != 0,
                }),
                31 => Method::PurgeOk(PurgeOk {
                    message_count: c.take_u32()?,
                }),
                40 => {
                    let ticket = c.take_u16()?;
                    let queue = c.take_shortstr()?;
                    let flags = c.take_u8()?;
                    Method::Delete(Delete {
                        ticket,
                        queue,
                        if_unused: bit(flags, 0),
                        if_empty: bit(flags, 1),
                        nowait: bit(flags, 2),
                    })
                }
                41 => Method::DeleteOk(DeleteOk {
                    message_count: c.take_u32()?,
                }),
                50 => Method::Unbind(Unbind {
                    ticket: c.take_u16()?,
                    queue: c.take_shortstr()?,
                    exchange: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                    arguments: c.take_table()?,
                }),
                51 => Method::UnbindOk(UnbindOk {}),
                _ => return Err(DecodeError("unknown queue method")),
            })
        }
    }
}

pub mod basic {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Qos {
        pub prefetch_size: u32,
        pub prefetch_count: u16,
        pub global: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct QosOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub struct Consume {
        pub ticket: u16,
        pub queue: String,
        pub consumer_tag: String,
        pub no_local: bool,
        pub no_ack: bool,
        pub exclusive: bool,
        pub nowait: bool,
        pub arguments: FieldTable,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct ConsumeOk {
        pub consumer_tag: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Cancel {
        pub consumer_tag: String,
        pub nowait: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct CancelOk {
        pub consumer_tag: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Publish {
        pub ticket: u16,
        pub exchange: String,
        pub routing_key: String,
        pub mandatory: bool,
        pub immediate: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Return {
        pub reply_code: u16,
        pub reply_text: String,
        pub exchange: String,
        pub routing_key: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Deliver {
        pub consumer_tag: String,
        pub delivery_tag: u64,
        pub redelivered: bool,
        pub exchange: String,
        pub routing_key: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Get {
        pub ticket: u16,
        pub queue: String,
        pub no_ack: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct GetOk {
        pub delivery_tag: u64,
        pub redelivered: bool,
        pub exchange: String,
        pub routing_key: String,
        pub message_count: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct GetEmpty {
        pub cluster_id: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Ack {
        pub delivery_tag: u64,
        pub multiple: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Reject {
        pub delivery_tag: u64,
        pub requeue: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Nack {
        pub delivery_tag: u64,
        pub multiple: bool,
        pub requeue: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Method {
        Qos(Qos),
        QosOk(QosOk),
        Consume(Consume),
        ConsumeOk(ConsumeOk),
        Cancel(Cancel),
        CancelOk(CancelOk),
        Publish(Publish),
        Return(Return),
        Deliver(Deliver),
        Get(Get),
        GetOk(GetOk),
        GetEmpty(GetEmpty),
        Ack(Ack),
        Reject(Reject),
        Nack(Nack),
    }

    impl Method {
        pub(super) fn method_id(&self) -> u16 {
            match self {
                Method::Qos(_) => 10,
                Method::QosOk(_) => 11,
                Method::Consume(_) => 20,
                Method::ConsumeOk(_) => 21,
                Method::Cancel(_) => 30,
                Method::CancelOk(_) => 31,
                Method::Publish(_) => 40,
                Method::Return(_) => 50,
                Method::Deliver(_) => 60,
                Method::Get(_) => 70,
                Method::GetOk(_) => 71,
                Method::GetEmpty(_) => 72,
                Method::Ack(_) => 80,
                Method::Reject(_) => 90,
                Method::Nack(_) => 120,
            }
        }

        pub(super) fn encode_args(&self, buf: &mut Vec<u8>) -> EncodeResult {
            match self {
                Method::Qos(m) => {
                    buf.extend_from_slice(&m.prefetch_size.to_be_bytes());
                    buf.extend_from_slice(&m.prefetch_count.to_be_bytes());
                    buf.push(m.global as u8);
                }
                Method::QosOk(_) => (),
                Method::Consume(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    encode_shortstr(buf, &m.consumer_tag)?;
                    buf.push(
                        m.no_local as u8
                            | (m.no_ack as u8) << 1
                            | (m.exclusive as u8) << 2
                            | (m.nowait as u8) << 3,
                    );
                    m.arguments.encode(buf)?;
                }
                Method::ConsumeOk(m) => encode_shortstr(buf, &m.consumer_tag)?,
                Method::Cancel(m) => {
                    encode_shortstr(buf, &m.consumer_tag)?;
                    buf.push(m.nowait as u8);
                }
                Method::CancelOk(m) => encode_shortstr(buf, &m.consumer_tag)?,
                Method::Publish(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.routing_key)?;
                    buf.push(m.mandatory as u8 | (m.immediate as u8) << 1);
                }
                Method::Return(m) => {
                    buf.extend_from_slice(&m.reply_code.to_be_bytes());
                    encode_shortstr(buf, &m.reply_text)?;
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.routing_key)?;
                }
                Method::Deliver(m) => {
                    encode_shortstr(buf, &m.consumer_tag)?;
                    buf.extend_from_slice(&m.delivery_tag.to_be_bytes());
                    buf.push(m.redelivered as u8);
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.routing_key)?;
                }
                Method::Get(m) => {
                    buf.extend_from_slice(&m.ticket.to_be_bytes());
                    encode_shortstr(buf, &m.queue)?;
                    buf.push(m.no_ack as u8);
                }
                Method::GetOk(m) => {
                    buf.extend_from_slice(&m.delivery_tag.to_be_bytes());
                    buf.push(m.redelivered as u8);
                    encode_shortstr(buf, &m.exchange)?;
                    encode_shortstr(buf, &m.routing_key)?;
                    buf.extend_from_slice(&m.message_count.to_be_bytes());
                }
                Method::GetEmpty(m) => encode_shortstr(buf, &m.cluster_id)?,
                Method::Ack(m) => {
                    buf.extend_from_slice(&m.delivery_tag.to_be_bytes());
                    buf.push(m.multiple as u8);
                }
                Method::Reject(m) => {
                    buf.extend_from_slice(&m.delivery_tag.to_be_bytes());
                    buf.push(m.requeue as u8);
                }
                Method::Nack(m) => {
                    buf.extend_from_slice(&m.delivery_tag.to_be_bytes());
                    buf.push(m.multiple as u8 | (m.requeue as u8) << 1);
                }
            }
            Ok(())
        }

        pub(super) fn decode_args(method_id: u16, c: &mut Cursor<'_>) -> DecodeResult<Method> {
            Ok(match method_id {
                10 => Method::Qos(Qos {
                    prefetch_size: c.take_u32()?,
                    prefetch_count: c.take_u16()?,
                    global: c.take_u8()? & 1 != 0,
                }),
                11 => Method::QosOk(QosOk {}),
                20 => {
                    let ticket = c.take_u16()?;
                    let queue = c.take_shortstr()?;
                    let consumer_tag = c.take_shortstr()?;
                    let flags = c.take_u8()?;
                    Method::Consume(Consume {
                        ticket,
                        queue,
                        consumer_tag,
                        no_local: bit(flags, 0),
                        no_ack: bit(flags, 1),
                        exclusive: bit(flags, 2),
                        nowait: bit(flags, 3),
                        arguments: c.take_table()?,
                    })
                }
                21 => Method::ConsumeOk(ConsumeOk {
                    consumer_tag: c.take_shortstr()?,
                }),
                30 => Method::Cancel(Cancel {
                    consumer_tag: c.take_shortstr()?,
                    nowait: c.take_u8()? & 1 != 0,
                }),
                31 => Method::CancelOk(CancelOk {
                    consumer_tag: c.take_shortstr()?,
                }),
                40 => {
                    let ticket = c.take_u16()?;
                    let exchange = c.take_shortstr()?;
                    let routing_key = c.take_shortstr()?;
                    let flags = c.take_u8()?;
                    Method::Publish(Publish {
                        ticket,
                        exchange,
                        routing_key,
                        mandatory: bit(flags, 0),
                        immediate: bit(flags, 1),
                    })
                }
                50 => Method::Return(Return {
                    reply_code: c.take_u16()?,
                    reply_text: c.take_shortstr()?,
                    exchange: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                }),
                60 => Method::Deliver(Deliver {
                    consumer_tag: c.take_shortstr()?,
                    delivery_tag: c.take_u64()?,
                    redelivered: c.take_u8()? & 1 != 0,
                    exchange: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                }),
                70 => Method::Get(Get {
                    ticket: c.take_u16()?,
                    queue: c.take_shortstr()?,
                    no_ack: c.take_u8()? & 1 != 0,
                }),
                71 => Method::GetOk(GetOk {
                    delivery_tag: c.take_u64()?,
                    redelivered: c.take_u8()? & 1 != 0,
                    exchange: c.take_shortstr()?,
                    routing_key: c.take_shortstr()?,
                    message_count: c.take_u32()?,
                }),
                72 => Method::GetEmpty(GetEmpty {
                    cluster_id: c.take_shortstr()?,
                }),
                80 => Method::Ack(Ack {
                    delivery_tag: c.take_u64()?,
                    multiple: c.take_u8()? & 1 != 0,
                }),
                90 => Method::Reject(Reject {
                    delivery_tag: c.take_u64()?,
                    requeue: c.take_u8()? & 1 != 0,
                }),
                120 => {
                    let delivery_tag = c.take_u64()?;
                    let flags = c.take_u8()?;
                    Method::Nack(Nack {
                        delivery_tag,
                        multiple: bit(flags, 0),
                        requeue: bit(flags, 1),
                    })
                }
                _ => return Err(DecodeError("unknown basic method")),
            })
        }
    }
}

pub mod confirm {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Select {
        pub nowait: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct SelectOk {}

    #[derive(Debug, Clone, PartialEq)]
    pub enum Method {
        Select(Select),
        SelectOk(SelectOk),
    }

    impl Method {
        pub(super) fn method_id(&self) -> u16 {
            match self {
                Method::Select(_) => 10,
                Method::SelectOk(_) => 11,
            }
        }

        pub(super) fn encode_args(&self, buf: &mut Vec<u8>) -> EncodeResult {
            match self {
                Method::Select(m) => buf.push(m.nowait as u8),
                Method::SelectOk(_) => (),
            }
            Ok(())
        }

        pub(super) fn decode_args(method_id: u16, c: &mut Cursor<'_>) -> DecodeResult<Method> {
            Ok(match method_id {
                10 => Method::Select(Select {
                    nowait: c.take_u8()? & 1 != 0,
                }),
                11 => Method::SelectOk(SelectOk {}),
                _ => return Err(DecodeError("unknown confirm method")),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::types::FieldValue;

    fn roundtrip(class: AmqpClass) {
        let mut buf = Vec::new();
        class.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(&buf);
        let decoded = AmqpClass::decode(&mut cursor).unwrap();
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(decoded, class);
    }

    #[test]
    fn queue_declare_bit_packing() {
        let mut arguments = FieldTable::new();
        arguments.insert("x-max-length", FieldValue::LongInt(1000));
        roundtrip(AmqpClass::Queue(queue::Method::Declare(queue::Declare {
            ticket: 0,
            queue: "work".to_string(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: true,
            nowait: false,
            arguments,
        })));
    }

    #[test]
    fn queue_declare_flags_share_one_octet() {
        let declare = queue::Method::Declare(queue::Declare {
            ticket: 0,
            queue: "q".to_string(),
            passive: true,
            durable: false,
            exclusive: true,
            auto_delete: false,
            nowait: true,
            arguments: FieldTable::new(),
        });
        let mut buf = Vec::new();
        AmqpClass::Queue(declare).encode(&mut buf).unwrap();
        // class(2) method(2) ticket(2) shortstr("q" = 2) then the flag octet
        assert_eq!(buf[8], 0b10101);
    }

    #[test]
    fn overlong_queue_name_fails_to_encode() {
        let declare = AmqpClass::Queue(queue::Method::Declare(queue::Declare {
            ticket: 0,
            queue: "q".repeat(300),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            nowait: false,
            arguments: FieldTable::new(),
        }));
        let err = declare.encode(&mut Vec::new()).unwrap_err();
        assert_eq!(err.length, 300);
    }

    #[test]
    fn basic_methods_roundtrip() {
        roundtrip(AmqpClass::Basic(basic::Method::Deliver(basic::Deliver {
            consumer_tag: "ctag-1".to_string(),
            delivery_tag: 42,
            redelivered: true,
            exchange: "logs".to_string(),
            routing_key: "info".to_string(),
        })));
        roundtrip(AmqpClass::Basic(basic::Method::Nack(basic::Nack {
            delivery_tag: 7,
            multiple: true,
            requeue: false,
        })));
        roundtrip(AmqpClass::Basic(basic::Method::GetEmpty(basic::GetEmpty {
            cluster_id: String::new(),
        })));
    }

    #[test]
    fn connection_start_ok_roundtrip() {
        let mut props = FieldTable::new();
        props.insert("product", FieldValue::LongString("coney".to_string()));
        roundtrip(AmqpClass::Connection(connection::Method::StartOk(
            connection::StartOk {
                client_properties: props,
                mechanism: "PLAIN".to_string(),
                response: "\u{0}guest\u{0}guest".to_string(),
                locale: "en_US".to_string(),
            },
        )));
    }

    #[test]
    fn exchange_unbind_ok_uses_id_51() {
        let m = AmqpClass::Exchange(exchange::Method::UnbindOk(exchange::UnbindOk {}));
        assert_eq!(m.ids(), (40, 51));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&60u16.to_be_bytes());
        buf.extend_from_slice(&200u16.to_be_bytes());
        assert!(AmqpClass::decode(&mut Cursor::new(&buf)).is_err());
    }
}
