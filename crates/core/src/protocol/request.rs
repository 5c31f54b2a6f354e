use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{ParseErrorKind, RtspError};

/// Opaque, caller-supplied value attached to a request by a hook and carried
/// into the subscriber session created from it.
#[derive(Clone)]
pub struct RequestContext(Arc<dyn Any + Send + Sync>);

impl RequestContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestContext(..)")
    }
}

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The body (e.g. the
/// SDP of an ANNOUNCE) is attached by the connection after reading
/// `Content-Length` bytes; see [`with_body`](Self::with_body).
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, ANNOUNCE, SETUP, RECORD, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream/trackID=0`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Address of the TCP peer that sent this request.
    pub peer_addr: Option<SocketAddr>,
    pub context: Option<RequestContext>,
}

impl RtspRequest {
    /// Parse an RTSP request head from its text representation.
    ///
    /// Expects the request line and headers, terminated by a blank line.
    /// Returns [`RtspError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let Some(request_line) = lines.next().filter(|l| !l.trim().is_empty()) else {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            });
        };

        let mut fields = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        };
        if version != "RTSP/1.0" {
            tracing::warn!(version, "peer sent non-RTSP/1.0 version");
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .ok_or(RtspError::Parse {
                        kind: ParseErrorKind::InvalidHeader,
                    })
            })
            .collect::<crate::error::Result<Vec<_>>>()?;

        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body: None,
            peer_addr: None,
            context: None,
        })
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Declared body length, `0` when the header is absent.
    pub fn content_length(&self) -> crate::error::Result<usize> {
        match self.get_header("Content-Length") {
            Some(v) => v.parse().map_err(|_| RtspError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }),
            None => Ok(0),
        }
    }

    /// Session ID from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }
}
