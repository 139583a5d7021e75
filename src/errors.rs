use snafu::Snafu;
use std::io;
use std::time::Duration;

/// A type alias for handling errors throughout burrow.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error that can occur from burrow.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The initial TCP connection could not be established.
    #[snafu(display("failed to connect to {}: {}", addr, source))]
    TcpConnectionFailed { addr: String, source: io::Error },

    /// An I/O error occurred on an established connection.
    #[snafu(display("I/O error: {}", source))]
    Io { source: io::Error },

    /// The underlying socket was closed by the peer outside a clean shutdown.
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    /// A frame header declared a payload size outside the negotiated bounds.
    #[snafu(display(
        "frame declares a {} byte payload but the maximum is {}",
        size,
        max
    ))]
    BadFrameLength { size: u32, max: u32 },

    /// A frame did not end with the frame-end octet.
    #[snafu(display("frame is missing the final frame-end octet"))]
    NoFinalOctet,

    /// Received bytes that do not decode as an AMQP frame.
    #[snafu(display("received malformed data - expected AMQP frame"))]
    MalformedFrame,

    /// The TLS handshake with the server failed.
    #[cfg(feature = "native-tls")]
    #[snafu(display("TLS handshake failed: {}", message))]
    TlsHandshake { message: String },

    /// The server stopped sending traffic for more than twice the negotiated
    /// heartbeat interval.
    #[snafu(display("missed heartbeats from server"))]
    MissedServerHeartbeats,

    /// The connection was lost and (if enabled) could not yet be recovered.
    #[snafu(display("network failure: {}", message))]
    NetworkFailure { message: String },

    /// The connection died while an operation was waiting on it.
    #[snafu(display("connection dropped: {}", message))]
    ConnectionDropped { message: String },

    /// The TCP connection closed during handshake without an AMQP-level
    /// explanation. Servers close the socket on bad credentials without
    /// sending a frame, so this is indistinguishable from an authentication
    /// failure on the wire.
    #[snafu(display(
        "connection closed during handshake - possible authentication failure"
    ))]
    PossibleAuthenticationFailure,

    /// The server explicitly rejected the connection during handshake.
    #[snafu(display("authentication failure (code={} message={})", code, message))]
    AuthenticationFailure { code: u16, message: String },

    /// The requested SASL mechanism is not offered by the server.
    #[snafu(display(
        "requested auth mechanism {} unavailable (available = {})",
        requested,
        available
    ))]
    UnsupportedAuthMechanism { available: String, requested: String },

    /// The requested locale is not offered by the server.
    #[snafu(display(
        "requested locale {} unavailable (available = {})",
        requested,
        available
    ))]
    UnsupportedLocale { available: String, requested: String },

    /// The negotiated frame max would fall below the protocol minimum.
    #[snafu(display("requested frame max {} is too small (min = {})", requested, min))]
    FrameMaxTooSmall { min: u32, requested: u32 },

    /// SASL secure / secure-ok challenge exchanges are not supported.
    #[snafu(display("SASL secure/secure-ok exchanges are not supported"))]
    SaslSecureNotSupported,

    /// Received a frame that does not fit the current protocol state.
    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    /// Server closed the channel with a 403 access-refused reply.
    #[snafu(display("access refused: {}", message))]
    AccessRefused { message: String },

    /// Server closed the channel with a 404 not-found reply.
    #[snafu(display("not found: {}", message))]
    NotFound { message: String },

    /// Server closed the channel with a 405 resource-locked reply.
    #[snafu(display("resource locked: {}", message))]
    ResourceLocked { message: String },

    /// Server closed the channel with a 406 precondition-failed reply.
    #[snafu(display("precondition failed: {}", message))]
    PreconditionFailed { message: String },

    /// Server closed the channel with a reply code that has no dedicated
    /// error variant.
    #[snafu(display(
        "server closed channel {} (code={} message={})",
        channel_id,
        code,
        message
    ))]
    ServerClosedChannel {
        channel_id: u16,
        code: u16,
        message: String,
    },

    /// An operation was issued on a channel that is no longer open.
    #[snafu(display("channel has been closed"))]
    ChannelAlreadyClosed,

    /// Server closed the whole connection.
    #[snafu(display("server closed connection (code={} message={})", code, message))]
    ServerClosedConnection { code: u16, message: String },

    /// The connection was closed locally while an operation was in flight.
    #[snafu(display("client closed connection"))]
    ClientClosedConnection,

    /// A synchronous protocol operation did not receive its reply within the
    /// continuation timeout.
    #[snafu(display("no reply received within {:?}", timeout))]
    ClientTimeout { timeout: Duration },

    /// `basic.qos` prefetch counts are a 16-bit protocol field.
    #[snafu(display("prefetch count {} out of range (max = 65535)", requested))]
    PrefetchCountOutOfRange { requested: u32 },

    /// Every channel id up to the negotiated channel max is in use.
    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    /// The explicitly requested channel id is out of range or already taken.
    #[snafu(display("requested channel id {} is unavailable", channel_id))]
    UnavailableChannelId { channel_id: u16 },

    /// The server sent a consumer tag that is already registered.
    #[snafu(display(
        "server sent duplicate consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    DuplicateConsumerTag { channel_id: u16, consumer_tag: String },

    /// The connection URL could not be interpreted.
    #[snafu(display("could not parse connection URL: {}", url))]
    InvalidUrl { url: String },

    /// Automatic recovery gave up after the configured number of attempts.
    #[snafu(display("gave up recovering connection after {} attempts", attempts))]
    RecoveryAttemptsExhausted { attempts: u32 },

    /// Serializing a frame failed; this is a bug in burrow.
    #[snafu(display("internal serialization error (this is a bug in burrow)"))]
    InternalSerializationError,

    /// The reader thread panicked.
    #[snafu(display("reader thread died unexpectedly: {}", message))]
    ReaderThreadPanic { message: String },
}

impl Error {
    /// Map a server-sent `channel.close` onto the specific channel-level
    /// error for its reply code.
    pub(crate) fn from_channel_close(channel_id: u16, code: u16, message: String) -> Error {
        match code {
            403 => Error::AccessRefused { message },
            404 => Error::NotFound { message },
            405 => Error::ResourceLocked { message },
            406 => Error::PreconditionFailed { message },
            _ => Error::ServerClosedChannel {
                channel_id,
                code,
                message,
            },
        }
    }

    /// Rebuild an equivalent error for handing the same failure to multiple
    /// waiting threads. Variants carrying unclonable sources degrade to
    /// `ConnectionDropped` with the rendered message.
    pub(crate) fn fanout(&self) -> Error {
        match self {
            Error::UnexpectedSocketClose => Error::UnexpectedSocketClose,
            Error::MissedServerHeartbeats => Error::MissedServerHeartbeats,
            Error::ClientClosedConnection => Error::ClientClosedConnection,
            Error::ChannelAlreadyClosed => Error::ChannelAlreadyClosed,
            Error::NetworkFailure { message } => Error::NetworkFailure {
                message: message.clone(),
            },
            Error::ServerClosedConnection { code, message } => Error::ServerClosedConnection {
                code: *code,
                message: message.clone(),
            },
            Error::ServerClosedChannel {
                channel_id,
                code,
                message,
            } => Error::ServerClosedChannel {
                channel_id: *channel_id,
                code: *code,
                message: message.clone(),
            },
            Error::RecoveryAttemptsExhausted { attempts } => Error::RecoveryAttemptsExhausted {
                attempts: *attempts,
            },
            other => Error::ConnectionDropped {
                message: format!("{}", other),
            },
        }
    }
}
