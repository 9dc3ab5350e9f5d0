//! Error types for the ingest server.

use std::fmt;
use std::time::Duration;

/// Errors that can occur anywhere in the ingest and streaming stack.
///
/// Variants map to specific failure modes:
///
/// - **Ingest**: [`Configuration`](Self::Configuration),
///   [`Encode`](Self::Encode), [`ResourceExhaustion`](Self::ResourceExhaustion),
///   [`UnknownStream`](Self::UnknownStream), [`StreamDegraded`](Self::StreamDegraded),
///   [`StreamStopped`](Self::StreamStopped), [`UnsupportedFormat`](Self::UnsupportedFormat),
///   [`InvalidFrame`](Self::InvalidFrame), [`OutOfOrder`](Self::OutOfOrder),
///   [`SlotBusy`](Self::SlotBusy).
/// - **Protocol**: [`Parse`](Self::Parse), malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io).
/// - **Session**: [`SessionTimeout`](Self::SessionTimeout).
/// - **Server**: [`AlreadyRunning`](Self::AlreadyRunning).
///
/// None of these cross the boolean Ingest API: [`StreamServer::put_frame`](crate::StreamServer::put_frame)
/// and friends log the error and return `false`.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid stream name, dimensions, frame rate or encoder policy.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The encoder rejected a frame. Counted towards the degraded threshold.
    #[error("encode error: {0}")]
    Encode(String),

    /// Encoder context, worker thread or socket could not be allocated.
    /// Fatal to the stream or session, never to the process.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// A session went quiet for longer than its timeout.
    #[error("session {id} timed out after {idle:?}")]
    SessionTimeout { id: String, idle: Duration },

    /// No stream registered under the given name.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// The stream hit its consecutive failure limit. Needs `stop` or `initialize`.
    #[error("stream degraded: {0}")]
    StreamDegraded(String),

    /// The stream was stopped while the call was in flight.
    #[error("stream stopped: {0}")]
    StreamStopped(String),

    /// Pixel format or stride layout the pipeline cannot convert.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Frame buffer does not match its declared geometry or the stream's.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Capture timestamp did not increase.
    #[error("frame for {stream} at {timestamp:?} is not after {last:?}")]
    OutOfOrder {
        stream: String,
        timestamp: Duration,
        last: Duration,
    },

    /// The frame slot stayed locked past the configured wait.
    #[error("frame slot busy for stream {0}")]
    SlotBusy(String),

    /// [`StreamServer::start`](crate::StreamServer::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

impl RtspError {
    /// Whether this failure should count towards the stream's
    /// consecutive encode-failure limit.
    pub fn counts_as_encode_failure(&self) -> bool {
        matches!(
            self,
            Self::Encode(_) | Self::InvalidFrame(_) | Self::UnsupportedFormat(_)
        )
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
