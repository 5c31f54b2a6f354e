//! Error types for the RTSP relay.

use std::fmt;

/// Errors that can occur in the relay core and its protocol adapters.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Request**: [`MalformedRequest`](Self::MalformedRequest),
///   [`MountMismatch`](Self::MountMismatch),
///   [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`Parse`](Self::Parse).
/// - **Lookup**: [`MountNotFound`](Self::MountNotFound),
///   [`StreamNotFound`](Self::StreamNotFound),
///   [`SessionNotFound`](Self::SessionNotFound).
/// - **Resources**: [`PortRangeExhausted`](Self::PortRangeExhausted),
///   [`Io`](Self::Io).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
///
/// The core never writes to the wire; adapters turn an error into a status
/// line with [`status_code`](Self::status_code).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request lacks something the core needs (remote address,
    /// `Transport` header, `client_port` pair).
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A client was built against a mount whose path differs from the request.
    #[error("mount {mount} does not match requested path {requested}")]
    MountMismatch { mount: String, requested: String },

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// The mount exists but has no media line with this index.
    #[error("stream {stream} not found on mount {path}")]
    StreamNotFound { path: String, stream: u32 },

    /// No session with the given ID (RFC 2326 §11.3.5, status 454).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The port pool has no free RTP/RTCP pair left, or bind retries ran out.
    #[error("RTP port range exhausted")]
    PortRangeExhausted,

    /// Interleaved TCP delivery was requested; only UDP is relayed.
    #[error("TCP transport is not supported")]
    UnsupportedTransport,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl RtspError {
    /// RTSP status code an adapter should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse {
                kind: ParseErrorKind::BodyTooLarge,
            } => 413,
            Self::MalformedRequest(_) | Self::MountMismatch { .. } | Self::Parse { .. } => 400,
            Self::MountNotFound(_) | Self::StreamNotFound { .. } => 404,
            Self::SessionNotFound(_) => 454,
            Self::UnsupportedTransport => 461,
            Self::PortRangeExhausted => 503,
            Self::Io(_) | Self::NotStarted | Self::AlreadyRunning => 500,
        }
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
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
    /// `Content-Length` exceeds what the server will read.
    BodyTooLarge,
}

impl ParseErrorKind {
    /// Whether the request body can no longer be located in the byte
    /// stream, so the connection cannot carry another request.
    pub fn breaks_framing(&self) -> bool {
        matches!(self, Self::InvalidContentLength | Self::BodyTooLarge)
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::BodyTooLarge => write!(f, "body too large"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(RtspError::MalformedRequest("x".into()).status_code(), 400);
        assert_eq!(RtspError::MountNotFound("/a".into()).status_code(), 404);
        assert_eq!(
            RtspError::StreamNotFound {
                path: "/a".into(),
                stream: 3
            }
            .status_code(),
            404
        );
        assert_eq!(RtspError::SessionNotFound("s".into()).status_code(), 454);
        assert_eq!(RtspError::PortRangeExhausted.status_code(), 503);
        assert_eq!(
            RtspError::Parse {
                kind: ParseErrorKind::BodyTooLarge
            }
            .status_code(),
            413
        );
    }
}
