use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{AuthOutcome, RequestHandler, authenticate, authorization_matches};
use crate::mount::{Hooks, Mounts};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::server::ServerConfig;
use crate::session::transport::{is_tcp, with_server_port};

/// Handles publisher RTSP methods for a single TCP connection.
///
/// ```text
/// OPTIONS  → capability list
/// ANNOUNCE → register the mount from the SDP body
/// SETUP    → bind the publisher-facing ports for one media line
/// RECORD   → start relaying
/// TEARDOWN → delete the mount
/// ```
///
/// The `Authorization` header accepted at ANNOUNCE must be repeated verbatim
/// on every later request of the connection.
pub struct PublishHandler {
    mounts: Mounts,
    hooks: Hooks,
    config: Arc<ServerConfig>,
    peer_addr: SocketAddr,
    authorization: Option<String>,
}

impl PublishHandler {
    pub fn new(mounts: Mounts, hooks: Hooks, config: Arc<ServerConfig>, peer_addr: SocketAddr) -> Self {
        Self {
            mounts,
            hooks,
            config,
            peer_addr,
            authorization: None,
        }
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", "OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN")
    }

    async fn handle_announce(&mut self, mut request: RtspRequest) -> RtspResponse {
        match authenticate(&self.hooks, &mut request).await {
            AuthOutcome::NotRequired => {}
            AuthOutcome::Accepted(header) => self.authorization = Some(header),
            AuthOutcome::Rejected => return RtspResponse::unauthorized(),
        }

        if let Some(check) = self.hooks.check_mount.clone()
            && !check.allow(&request).await
        {
            tracing::warn!(peer = %self.peer_addr, uri = %request.uri, "publish refused by mount check");
            return RtspResponse::status(403);
        }

        let sdp = request.body.as_deref().unwrap_or_default();
        let mount = self
            .mounts
            .add_mount(&request.uri, sdp, self.hooks.clone())
            .await;

        RtspResponse::ok().add_header(
            "Session",
            &format!("{};timeout={}", mount.id(), self.config.publish_session_timeout_secs),
        )
    }

    async fn handle_setup(&mut self, request: RtspRequest) -> RtspResponse {
        let Some(mount) = self.mounts.get_mount(&request.uri) else {
            tracing::warn!(uri = %request.uri, "publisher SETUP for unknown mount");
            return RtspResponse::not_found();
        };

        let Some(transport) = request.get_header("Transport") else {
            return RtspResponse::bad_request();
        };
        if is_tcp(transport) {
            tracing::warn!(peer = %self.peer_addr, transport, "publisher requested TCP transport");
            return RtspResponse::status(501);
        }

        match mount.create_stream(&request.uri).await {
            Ok(ports) => RtspResponse::ok()
                .add_header(
                    "Transport",
                    &with_server_port(transport, ports.rtp_start_port, ports.rtp_end_port),
                )
                .add_header("Session", mount.id()),
            Err(e) => {
                tracing::warn!(uri = %request.uri, error = %e, "publisher SETUP failed");
                RtspResponse::from_error(&e)
            }
        }
    }

    async fn handle_record(&mut self, request: RtspRequest) -> RtspResponse {
        let Some(mount) = self.mounts.get_mount(&request.uri) else {
            return RtspResponse::not_found();
        };
        if request.session_id() != Some(mount.id()) {
            tracing::warn!(uri = %request.uri, session = ?request.session_id(), "RECORD for wrong session");
            return RtspResponse::session_not_found();
        }

        if let Some(range) = request.get_header("Range") {
            mount.set_range(range);
        }

        match mount.setup().await {
            Ok(()) => RtspResponse::ok().add_header("Session", mount.id()),
            Err(e) => {
                tracing::error!(path = %mount.path(), error = %e, "RECORD failed");
                RtspResponse::status(500)
            }
        }
    }

    async fn handle_teardown(&mut self, request: RtspRequest) -> RtspResponse {
        let Some(mount) = self.mounts.get_mount(&request.uri) else {
            return RtspResponse::not_found();
        };
        if let Some(session) = request.session_id()
            && session != mount.id()
        {
            return RtspResponse::session_not_found();
        }

        self.mounts.delete_mount(&request.uri).await;
        RtspResponse::ok()
    }
}

#[async_trait]
impl RequestHandler for PublishHandler {
    async fn handle(&mut self, request: RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();
        let method = request.method.clone();
        tracing::debug!(peer = %self.peer_addr, %method, uri = %request.uri, %cseq, "publish request");

        let response = match method.as_str() {
            "OPTIONS" => self.handle_options(),
            "ANNOUNCE" => self.handle_announce(request).await,
            "SETUP" | "RECORD" | "TEARDOWN"
                if !authorization_matches(&self.hooks, &request, self.authorization.as_deref()) =>
            {
                RtspResponse::unauthorized()
            }
            "SETUP" => self.handle_setup(request).await,
            "RECORD" => self.handle_record(request).await,
            "TEARDOWN" => self.handle_teardown(request).await,
            other => {
                tracing::warn!(method = other, "unsupported publisher method");
                RtspResponse::status(501)
            }
        };
        response.add_header("CSeq", &cseq)
    }
}
