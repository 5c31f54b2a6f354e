//! RTSP signaling adapters (RFC 2326).
//!
//! This module turns RTSP requests into calls on the relay core and maps
//! the outcome back to a response. Two roles listen on separate ports:
//!
//! | Role | Handler | Methods |
//! |------|---------|---------|
//! | Publisher | [`PublishHandler`] | OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN |
//! | Subscriber | [`PlayHandler`] | OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER |
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! ANNOUNCE rtsp://server/live RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 123\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! Every response echoes the request's `CSeq`.

pub mod auth;
pub mod play;
pub mod publish;
pub mod request;
pub mod response;
pub mod sdp;

use async_trait::async_trait;

pub use play::PlayHandler;
pub use publish::PublishHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;

use crate::mount::Hooks;
use auth::BasicCredentials;

/// Per-connection RTSP method dispatcher.
#[async_trait]
pub trait RequestHandler: Send + 'static {
    async fn handle(&mut self, request: RtspRequest) -> RtspResponse;
}

pub(crate) enum AuthOutcome {
    /// No authenticator is configured.
    NotRequired,
    /// Credentials accepted; carries the `Authorization` header value.
    Accepted(String),
    Rejected,
}

/// Run the configured authenticator against the request's Basic credentials.
pub(crate) async fn authenticate(hooks: &Hooks, request: &mut RtspRequest) -> AuthOutcome {
    let Some(authenticator) = hooks.authentication.clone() else {
        return AuthOutcome::NotRequired;
    };
    let Some(header) = request.get_header("Authorization").map(str::to_string) else {
        return AuthOutcome::Rejected;
    };
    let Some(credentials) = BasicCredentials::parse(&header) else {
        return AuthOutcome::Rejected;
    };

    if authenticator
        .authenticate(&credentials.username, &credentials.password, request)
        .await
    {
        AuthOutcome::Accepted(header)
    } else {
        tracing::warn!(user = %credentials.username, uri = %request.uri, "credentials rejected");
        AuthOutcome::Rejected
    }
}

/// Whether `request` repeats the `Authorization` header accepted earlier.
/// Always true when no authenticator is configured.
pub(crate) fn authorization_matches(hooks: &Hooks, request: &RtspRequest, accepted: Option<&str>) -> bool {
    if hooks.authentication.is_none() {
        return true;
    }
    match (request.get_header("Authorization"), accepted) {
        (Some(sent), Some(accepted)) => sent == accepted,
        _ => false,
    }
}
