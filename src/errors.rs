use snafu::Snafu;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// A type alias for handling errors throughout coney.
pub type Result<T> = std::result::Result<T, Error>;

/// Clonable wrapper around `std::io::Error`.
///
/// Errors fan out to every outstanding RPC, confirm handle, and consumer
/// when a connection dies, so the whole error type must be `Clone`.
#[derive(Debug, Clone)]
pub struct IoError(Arc<std::io::Error>);

impl IoError {
    pub fn kind(&self) -> std::io::ErrorKind {
        self.0.kind()
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for IoError {}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> IoError {
        IoError(Arc::new(err))
    }
}

/// Specific error cases returned by coney.
#[derive(Clone, Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// URL parsing failed.
    #[snafu(display("could not parse url: {}", source))]
    UrlParseError { source: url::ParseError },

    /// URL could not be decoded into an AMQP or AMQPS connection string.
    #[snafu(display("invalid url ({}): {}", reason, url))]
    InvalidUrl { url: Url, reason: &'static str },

    /// An insecure URL was supplied to a method that only allows `amqps`.
    #[snafu(display("insecure URL passed to method that only allows secure connections"))]
    InsecureUrl,

    /// A TLS endpoint was requested, but this crate only dials plain TCP;
    /// TLS transports must be established externally and passed in.
    #[snafu(display("TLS endpoints require an externally-established stream"))]
    TlsNotSupported,

    /// An endpoint list could not be parsed.
    #[snafu(display("invalid endpoint list ({}): {}", reason, list))]
    InvalidEndpointList { list: String, reason: &'static str },

    /// No candidate endpoint accepted the connection. Wraps the error from
    /// the final attempt.
    #[snafu(display("no broker reachable after {} attempts: {}", attempts, source))]
    BrokerUnreachable {
        attempts: usize,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Timeout occurred while performing the initial TCP connection.
    #[snafu(display("timeout occurred while waiting for TCP connection"))]
    ConnectionTimeout,

    /// The handshake did not complete within the handshake continuation
    /// timeout.
    #[snafu(display("AMQP handshake timed out"))]
    HandshakeTimeout,

    /// An RPC reply did not arrive within the continuation timeout.
    #[snafu(display("timeout waiting for server response on channel {}", channel_id))]
    ContinuationTimeout { channel_id: u16 },

    /// The underlying socket was closed.
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    /// We received data that could not be parsed as an AMQP frame.
    #[snafu(display("received malformed data - {}", reason))]
    MalformedFrame { reason: &'static str },

    /// The server sent a frame larger than the negotiated frame-max.
    #[snafu(display("received frame of {} bytes (frame-max is {})", size, frame_max))]
    FrameTooLarge { size: usize, frame_max: usize },

    /// The server announced a message body larger than the configured
    /// inbound limit.
    #[snafu(display("inbound message body of {} bytes exceeds limit of {}", body_size, limit))]
    MessageTooLarge { body_size: u64, limit: u64 },

    /// A caller-supplied name (queue, exchange, routing key, consumer tag,
    /// table key, or short property) exceeded the protocol's 255-byte
    /// short-string limit. Nothing was sent; truncating would silently
    /// corrupt the name on the wire.
    #[snafu(display(
        "name of {} bytes exceeds the protocol's 255-byte short-string limit",
        length
    ))]
    ShortStringTooLong { length: usize },

    /// We received a valid AMQP frame but not one we expected; e.g., an
    /// incorrect response to an RPC, or content frames without a preceding
    /// content-bearing method.
    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    /// No SASL mechanism was supported by both peers.
    #[snafu(display("no common auth mechanism (server offers: {})", available))]
    UnsupportedAuthMechanism { available: String },

    /// The server does not support the requested locale.
    #[snafu(display(
        "requested locale {} unavailable (available = {})",
        requested,
        available
    ))]
    UnsupportedLocale { available: String, requested: String },

    /// The negotiated frame size is smaller than the minimum required by
    /// AMQP.
    #[snafu(display("requested frame max {} is too small (min = {})", requested, min))]
    FrameMaxTooSmall { min: u32, requested: u32 },

    /// The supplied authentication credentials were not accepted.
    #[snafu(display("invalid credentials"))]
    InvalidCredentials,

    /// The server missed too many successive heartbeats.
    #[snafu(display("missed heartbeats from server"))]
    MissedServerHeartbeats,

    /// The server closed the connection with the given reply code and text.
    #[snafu(display("server closed connection (code={} message={})", code, message))]
    ServerClosedConnection { code: u16, message: String },

    /// The client closed the connection.
    #[snafu(display("client closed connection"))]
    ClientClosedConnection,

    /// The server closed the given channel; the channel is terminal and a
    /// new one must be opened.
    #[snafu(display(
        "server closed channel {} (code={}, message={}, method={}:{})",
        channel_id,
        code,
        message,
        class_id,
        method_id
    ))]
    ServerClosedChannel {
        channel_id: u16,
        code: u16,
        message: String,
        class_id: u16,
        method_id: u16,
    },

    /// The client closed the channel.
    #[snafu(display("channel has been closed"))]
    ClientClosedChannel,

    /// An in-flight operation was aborted because its channel or connection
    /// went away before the reply arrived.
    #[snafu(display("operation interrupted by channel or connection close"))]
    OperationInterrupted,

    /// The caller cancelled the operation before it resolved.
    #[snafu(display("operation cancelled by caller"))]
    Cancelled,

    /// Automatic recovery gave up; the connection is permanently closed.
    #[snafu(display("connection recovery abandoned: {}", message))]
    RecoveryFailed { message: String },

    /// The I/O loop attempted to send a message to a caller that did not
    /// exist. This indicates either a bug in coney or a connection in a bad
    /// state and in the process of tearing down.
    #[snafu(display("i/o loop thread tried to communicate with a nonexistent client"))]
    EventLoopClientDropped,

    /// The I/O loop has dropped the sending side of a channel, typically
    /// because it has exited due to another error.
    #[snafu(display("i/o loop dropped sending side of a channel"))]
    EventLoopDropped,

    /// The client sent an AMQP exception to the server and closed the
    /// connection.
    #[snafu(display("internal client exception - received unhandled frames from server"))]
    ClientException,

    /// No more channels can be opened because all channel ids up to the
    /// negotiated channel-max are in use.
    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    /// An explicit channel ID was requested, but that channel is
    /// unavailable for use.
    #[snafu(display("requested channel id {} is unavailable", channel_id))]
    UnavailableChannelId { channel_id: u16 },

    /// The server sent frames for a channel ID we don't know about.
    #[snafu(display("received frame for nonexistent channel {}", channel_id))]
    ReceivedFrameWithBogusChannelId { channel_id: u16 },

    /// The server sent us a consumer tag equal to another consumer tag we
    /// already have on the same channel.
    #[snafu(display(
        "server sent duplicate consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    DuplicateConsumerTag { channel_id: u16, consumer_tag: String },

    /// The server sent us a delivery for a consumer tag we don't know
    /// about.
    #[snafu(display(
        "received delivery with unknown consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    UnknownConsumerTag { channel_id: u16, consumer_tag: String },

    /// The I/O thread panicked.
    #[snafu(display("I/O thread panicked"))]
    IoThreadPanic,

    /// Forking the I/O thread failed.
    #[snafu(display("fork failed: {}", source))]
    ForkFailed {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// Creating the connection's poll handle failed.
    #[snafu(display("failed to create poll handle: {}", source))]
    CreatePollHandle {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// Registering an event source with the poll handle failed.
    #[snafu(display("failed to register with poll handle: {}", source))]
    RegisterWithPollHandle {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// Deregistering an event source from the poll handle failed.
    #[snafu(display("failed to deregister with poll handle: {}", source))]
    DeregisterWithPollHandle {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// Polling for events failed.
    #[snafu(display("failed to poll: {}", source))]
    FailedToPoll {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// An I/O error occurred while reading the socket.
    #[snafu(display("I/O error reading socket: {}", source))]
    IoErrorReadingSocket {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// An I/O error occurred while writing the socket.
    #[snafu(display("I/O error writing socket: {}", source))]
    IoErrorWritingSocket {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },

    /// An I/O error occurred while opening the TCP connection.
    #[snafu(display("failed to connect: {}", source))]
    FailedToConnect {
        #[snafu(source(from(std::io::Error, IoError::from)))]
        source: IoError,
    },
}

impl Error {
    /// True if this failure is involuntary and the auto-recovery engine
    /// should attempt to re-establish the transport. Voluntary closes and
    /// protocol violations we caused are not recovered.
    pub(crate) fn is_recoverable(&self) -> bool {
        match self {
            Error::UnexpectedSocketClose
            | Error::MissedServerHeartbeats
            | Error::IoErrorReadingSocket { .. }
            | Error::IoErrorWritingSocket { .. }
            | Error::FailedToPoll { .. } => true,
            Error::ServerClosedConnection { code, .. } => {
                *code == crate::wire::constants::CONNECTION_FORCED
            }
            _ => false,
        }
    }
}
