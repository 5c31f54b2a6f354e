use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{AuthOutcome, RequestHandler, authenticate, authorization_matches};
use crate::error::RtspError;
use crate::mount::{Hooks, MountInfo, MountState, Mounts};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::server::ServerConfig;
use crate::session::transport::{is_tcp, with_server_port};
use crate::session::{ClientWrapper, SessionManager};

const PUBLIC: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER";

/// Handles subscriber RTSP methods for a single TCP connection.
///
/// Sessions outlive the connection: a player may reconnect and keep using
/// its `Session` id until TEARDOWN or keepalive expiry.
pub struct PlayHandler {
    mounts: Mounts,
    sessions: SessionManager,
    hooks: Hooks,
    config: Arc<ServerConfig>,
    peer_addr: SocketAddr,
}

impl PlayHandler {
    pub fn new(
        mounts: Mounts,
        sessions: SessionManager,
        hooks: Hooks,
        config: Arc<ServerConfig>,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            mounts,
            sessions,
            hooks,
            config,
            peer_addr,
        }
    }

    fn session_header(&self, session: &ClientWrapper) -> String {
        format!("{};timeout={}", session.id(), self.config.session_timeout.as_secs())
    }

    /// Look up the request's session and check it repeats the credentials
    /// the session was created with.
    fn existing_session(&self, request: &RtspRequest) -> Result<Arc<ClientWrapper>, RtspResponse> {
        let session = request
            .session_id()
            .and_then(|id| self.sessions.get_session(id))
            .ok_or_else(|| {
                tracing::warn!(peer = %self.peer_addr, session = ?request.session_id(), "unknown session");
                RtspResponse::session_not_found()
            })?;

        if !authorization_matches(&self.hooks, request, Some(session.authorization())) {
            return Err(RtspResponse::unauthorized());
        }

        let requested = MountInfo::from_uri(&request.uri).path;
        if requested != session.mount().path() {
            tracing::warn!(
                session_id = %session.id(),
                mount = %session.mount().path(),
                %requested,
                "session used against another mount"
            );
            return Err(RtspResponse::session_not_found());
        }
        Ok(session)
    }

    /// Like [`existing_session`](Self::existing_session), but a session whose
    /// mount was torn down is closed and reported as gone.
    async fn live_session(&self, request: &RtspRequest) -> Result<Arc<ClientWrapper>, RtspResponse> {
        let session = self.existing_session(request)?;
        if session.mount().state() == MountState::TornDown {
            tracing::info!(session_id = %session.id(), mount = %session.mount().path(), "mount gone, closing session");
            session.close().await;
            return Err(RtspResponse::session_not_found());
        }
        Ok(session)
    }

    /// Re-arm the keepalive of the request's session, if any and its mount
    /// is still up.
    fn touch_session(&self, request: &RtspRequest) -> Option<Arc<ClientWrapper>> {
        let session = request.session_id().and_then(|id| self.sessions.get_session(id))?;
        if session.mount().state() != MountState::TornDown {
            session.keepalive();
        }
        Some(session)
    }

    fn handle_options(&self, request: &RtspRequest) -> RtspResponse {
        self.touch_session(request);
        RtspResponse::ok().add_header("Public", PUBLIC)
    }

    async fn handle_describe(&mut self, mut request: RtspRequest) -> RtspResponse {
        if let AuthOutcome::Rejected = authenticate(&self.hooks, &mut request).await {
            return RtspResponse::unauthorized();
        }

        let Some(mount) = self.mounts.get_mount(&request.uri) else {
            tracing::warn!(uri = %request.uri, "DESCRIBE for unknown mount");
            return RtspResponse::not_found();
        };

        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &format!("{}/", request.uri.trim_end_matches('/')))
            .with_body(mount.sdp().to_string())
    }

    async fn handle_setup(&mut self, mut request: RtspRequest) -> RtspResponse {
        let Some(transport) = request.get_header("Transport").map(str::to_string) else {
            return RtspResponse::bad_request();
        };
        if is_tcp(&transport) {
            tracing::warn!(peer = %self.peer_addr, %transport, "player requested TCP transport");
            return RtspResponse::from_error(&RtspError::UnsupportedTransport).add_header(
                "Unsupported",
                "RTP/AVP/TCP (interleaved) not supported; use RTP/AVP (UDP)",
            );
        }

        let (session, created) = if request.session_id().is_some() {
            match self.live_session(&request).await {
                Ok(session) => (session, false),
                Err(response) => return response,
            }
        } else {
            if let AuthOutcome::Rejected = authenticate(&self.hooks, &mut request).await {
                return RtspResponse::unauthorized();
            }
            match self.sessions.create_session(&self.mounts, &request) {
                Ok(session) => (session, true),
                Err(e) => {
                    tracing::warn!(uri = %request.uri, error = %e, "SETUP for unknown mount");
                    return RtspResponse::from_error(&e);
                }
            }
        };

        let client = match session.add_client(&request).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(session_id = %session.id(), uri = %request.uri, error = %e, "subscriber SETUP failed");
                if created {
                    session.close().await;
                }
                return RtspResponse::from_error(&e);
            }
        };

        let (Some(rtp), Some(rtcp)) = (client.rtp_server_port(), client.rtcp_server_port()) else {
            return RtspResponse::status(500);
        };
        tracing::info!(
            session_id = %session.id(),
            client_id = %client.id(),
            mount = %client.mount_path(),
            stream = client.stream_id(),
            server_rtp_port = rtp,
            "subscriber SETUP"
        );

        RtspResponse::ok()
            .add_header("Transport", &with_server_port(&transport, rtp, rtcp))
            .add_header("Session", &self.session_header(&session))
    }

    async fn handle_play(&self, request: &RtspRequest) -> RtspResponse {
        let session = match self.live_session(request).await {
            Ok(session) => session,
            Err(response) => return response,
        };

        session.play();
        let range = session
            .mount()
            .range()
            .unwrap_or_else(|| "npt=0.000-".to_string());

        RtspResponse::ok()
            .add_header("Session", &self.session_header(&session))
            .add_header("Range", &range)
    }

    async fn handle_teardown(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.existing_session(request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        session.close().await;
        if let Some(events) = &self.hooks.events {
            events.client_close(session.mount());
        }
        tracing::info!(session_id = %session.id(), "session terminated via TEARDOWN");
        RtspResponse::ok()
    }

    /// GET_PARAMETER is used by players (e.g. VLC) as a keepalive
    /// (RFC 2326 §10.8).
    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        let mut response = RtspResponse::ok();
        if let Some(session) = self.touch_session(request) {
            response = response.add_header("Session", &self.session_header(&session));
        }
        response
    }
}

#[async_trait]
impl RequestHandler for PlayHandler {
    async fn handle(&mut self, request: RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();
        let method = request.method.clone();
        tracing::debug!(peer = %self.peer_addr, %method, uri = %request.uri, %cseq, "play request");

        let response = match method.as_str() {
            "OPTIONS" => self.handle_options(&request),
            "DESCRIBE" => self.handle_describe(request).await,
            "SETUP" => self.handle_setup(request).await,
            "PLAY" => self.handle_play(&request).await,
            "TEARDOWN" => self.handle_teardown(&request).await,
            "GET_PARAMETER" => self.handle_get_parameter(&request),
            other => {
                tracing::warn!(method = other, "unsupported player method");
                RtspResponse::status(501)
            }
        };
        response.add_header("CSeq", &cseq)
    }
}
