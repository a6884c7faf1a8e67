//! Protocol constants from the AMQP 0-9-1 specification.

/// The 8-byte preamble sent before any frame: `AMQP` followed by the
/// protocol version 0-9-1.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Size of the generic frame header (type + channel + payload length).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Total per-frame overhead: 7-byte header plus the frame-end octet.
pub const FRAME_OVERHEAD: usize = 8;

/// Every frame is terminated by this octet; anything else is a framing
/// error that must terminate the connection.
pub const FRAME_END: u8 = 0xCE;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

/// The minimum frame-max either peer may negotiate down to.
pub const FRAME_MIN_SIZE: u32 = 4096;

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;
pub const CLASS_CONFIRM: u16 = 85;

pub const REPLY_SUCCESS: u16 = 200;

// soft errors (channel-fatal)
pub const CONTENT_TOO_LARGE: u16 = 311;
pub const NO_CONSUMERS: u16 = 313;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;

// hard errors (connection-fatal)
pub const CONNECTION_FORCED: u16 = 320;
pub const INVALID_PATH: u16 = 402;
pub const FRAME_ERROR: u16 = 501;
pub const SYNTAX_ERROR: u16 = 502;
pub const COMMAND_INVALID: u16 = 503;
pub const CHANNEL_ERROR: u16 = 504;
pub const UNEXPECTED_FRAME: u16 = 505;
pub const RESOURCE_ERROR: u16 = 506;
pub const NOT_ALLOWED: u16 = 530;
pub const NOT_IMPLEMENTED: u16 = 540;
pub const INTERNAL_ERROR: u16 = 541;

/// True if `code` is a channel-level (soft) error that closes only the
/// channel it occurred on.
pub fn is_soft_error(code: u16) -> bool {
    matches!(
        code,
        CONTENT_TOO_LARGE | NO_CONSUMERS | ACCESS_REFUSED | NOT_FOUND | RESOURCE_LOCKED
            | PRECONDITION_FAILED
    )
}
