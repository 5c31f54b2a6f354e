use std::fmt::Write;

use crate::error::RtspError;

/// A status line plus headers and an optional body, built by chaining
/// [`add_header`](Self::add_header) / [`with_body`](Self::with_body).
///
/// Every response carries `Server:`; handlers append `CSeq:` last.
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Value of the `Server` header (RFC 2326 §12.36).
pub const SERVER_AGENT: &str = "rtsp-relay/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// Build a response carrying the standard reason phrase for `code`.
    pub fn status(code: u16) -> Self {
        Self::new(code, reason_phrase(code))
    }

    /// 200 OK, success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::status(200)
    }

    /// 404 Not Found: the requested resource does not exist.
    pub fn not_found() -> Self {
        Self::status(404)
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::status(400)
    }

    /// 401 with a Basic challenge.
    pub fn unauthorized() -> Self {
        Self::status(401).add_header("WWW-Authenticate", "Basic realm=\"rtsp\"")
    }

    /// 454 Session Not Found.
    pub fn session_not_found() -> Self {
        Self::status(454)
    }

    /// Map a core error onto its status line.
    pub fn from_error(err: &RtspError) -> Self {
        Self::status(err.status_code())
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Wire form. A present body gets a computed `Content-Length`.
    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        let body = self.body.as_deref().unwrap_or_default();
        if !body.is_empty() {
            let _ = write!(out, "Content-Length: {}\r\n", body.len());
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Request Entity Too Large",
        454 => "Session Not Found",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_reply_wire_form() {
        let sdp = "v=0\r\ns=Cam\r\n";
        let wire = RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp.to_string())
            .add_header("CSeq", "3")
            .serialize();
        assert_eq!(
            wire,
            format!(
                "RTSP/1.0 200 OK\r\nServer: rtsp-relay/0.1\r\nContent-Type: application/sdp\r\nCSeq: 3\r\nContent-Length: {}\r\n\r\n{sdp}",
                sdp.len()
            )
        );
    }

    #[test]
    fn bodiless_reply_ends_with_blank_line() {
        let wire = RtspResponse::status(503).add_header("CSeq", "9").serialize();
        assert!(wire.starts_with("RTSP/1.0 503 Service Unavailable\r\n"));
        assert!(!wire.contains("Content-Length"));
        assert!(wire.ends_with("CSeq: 9\r\n\r\n"));
    }

    #[test]
    fn error_statuses() {
        let resp = RtspResponse::from_error(&RtspError::SessionNotFound("x".into()));
        assert_eq!(resp.status_code, 454);
        assert!(resp.serialize().starts_with("RTSP/1.0 454 Session Not Found\r\n"));

        let resp = RtspResponse::unauthorized();
        assert_eq!(resp.get_header("WWW-Authenticate"), Some("Basic realm=\"rtsp\""));
    }
}
