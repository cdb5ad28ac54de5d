//! Error types for the RTSP client library.

use std::fmt;

/// Errors that can occur in the RTSP client library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Connect**: [`Connection`](Self::Connection), the control socket
///   could not be opened.
/// - **Control plane**: [`Protocol`](Self::Protocol),
///   [`Authentication`](Self::Authentication), [`NoTrack`](Self::NoTrack).
/// - **Media plane**: [`Transport`](Self::Transport) and
///   [`Framing`](Self::Framing), raised while receiving.
/// - **Policy**: [`Timeout`](Self::Timeout), [`Cancelled`](Self::Cancelled).
///
/// Malformed individual RTP/RTCP packets never surface here; they are
/// dropped by the stream engine.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// The TCP connection to the RTSP server (or HTTP tunnel) failed.
    #[error("connection failed: {0}")]
    Connection(#[source] std::io::Error),

    /// A connect or receive window elapsed. Distinct from cancellation.
    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    /// The server answered 401 and the configured credentials (if any)
    /// were rejected.
    #[error("invalid login and/or password")]
    Authentication,

    /// Malformed response, missing header or unexpected status code.
    #[error("RTSP protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// None of the described tracks matched the required track kinds.
    #[error("no suitable track found")]
    NoTrack,

    /// Socket failure while the session was running.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed interleaved framing on the shared RTSP stream.
    #[error("interleaved framing error: {kind}")]
    Framing { kind: FramingErrorKind },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// `receive`, `play` or `pause` was called before a successful connect.
    #[error("client is not connected")]
    NotConnected,

    /// The configured URI cannot be used for RTSP.
    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

impl RtspError {
    pub(crate) fn protocol(kind: ProtocolErrorKind) -> Self {
        Self::Protocol { kind }
    }

    pub(crate) fn framing(kind: FramingErrorKind) -> Self {
        Self::Framing { kind }
    }
}

/// Which bound was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Receive,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connection"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Specific kind of RTSP control-plane failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Status line did not have the `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
    /// A required response header was absent.
    MissingHeader(&'static str),
    /// The `Transport` header had no usable port/channel pair.
    InvalidTransport,
    /// The server answered with a status other than 200.
    BadStatus { code: u16, reason: String },
    /// `WWW-Authenticate` named a scheme we cannot answer.
    UnsupportedAuthentication,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::MissingHeader(name) => write!(f, "missing {name} header"),
            Self::InvalidTransport => write!(f, "server ports are not found"),
            Self::BadStatus { code, reason } => write!(f, "bad response code {code} {reason}"),
            Self::UnsupportedAuthentication => write!(f, "unsupported authentication scheme"),
        }
    }
}

/// Specific kind of interleaved framing failure (RFC 2326 §10.12).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingErrorKind {
    /// The server closed the stream.
    EndOfStream,
    /// A block started with something other than `$` or an RTSP response.
    UnexpectedByte(u8),
}

impl fmt::Display for FramingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::UnexpectedByte(b) => write!(f, "unexpected byte {b:#04x}"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
