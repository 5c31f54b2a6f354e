//! Subscriber RTSP sessions (RFC 2326 §3, §12.37).
//!
//! A subscriber session groups the [`Client`]s a player set up for one
//! mount (usually one per media line) behind a single `Session` id. It is
//! created by the first SETUP and destroyed by TEARDOWN, by keepalive expiry,
//! or when the server shuts down.
//!
//! ## Keepalive
//!
//! Each session owns exactly one inactivity timer. Any liveliness signal
//! re-arms it by aborting the pending timer task and spawning a fresh one:
//!
//! - PLAY, OPTIONS and GET_PARAMETER requests carrying the session id.
//! - Any datagram a player sends to one of the session's RTCP sockets
//!   (receiver reports). Some players never send RTSP keepalives.
//!
//! When the timer fires, the session closes through the same path as
//! TEARDOWN.

pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::error::{Result, RtspError};
use crate::mount::{Mount, Mounts};
use crate::protocol::RtspRequest;
use crate::protocol::request::RequestContext;

/// Default subscriber inactivity timeout (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

type SessionMap = RwLock<HashMap<String, Arc<ClientWrapper>>>;

/// Fresh 16-character hex identifier for sessions, mounts and clients.
pub(crate) fn new_id() -> String {
    format!("{:016X}", rand::random::<u64>())
}

/// One subscriber session.
pub struct ClientWrapper {
    id: String,
    mount: Arc<Mount>,
    registry: Weak<SessionMap>,
    context: Option<RequestContext>,
    authorization: String,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl ClientWrapper {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Value a hook attached to the request that created this session.
    pub fn context(&self) -> Option<&RequestContext> {
        self.context.as_ref()
    }

    /// `Authorization` header captured at SETUP; empty when none was sent.
    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.lock().keys().cloned().collect()
    }

    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.lock().get(id).cloned()
    }

    /// Set up a [`Client`] for the media line addressed by `request` and add
    /// it to this session.
    ///
    /// RTCP arriving on the client's socket re-arms the session keepalive.
    pub async fn add_client(self: &Arc<Self>, request: &RtspRequest) -> Result<Arc<Client>> {
        if self.is_closed() {
            return Err(RtspError::SessionNotFound(self.id.clone()));
        }

        let client = Arc::new(Client::new(&self.mount, request)?);
        if let Err(e) = client.setup().await {
            client.close().await;
            return Err(e);
        }
        if let Err(e) = client.attach() {
            client.close().await;
            return Err(e);
        }

        let session = Arc::downgrade(self);
        client.listen_rtcp(move || {
            if let Some(session) = session.upgrade() {
                session.keepalive();
            }
        });

        self.clients
            .lock()
            .insert(client.id().to_string(), client.clone());

        if self.is_closed() {
            // lost a race with close(); nothing else will close this client
            self.clients.lock().remove(client.id());
            client.close().await;
            return Err(RtspError::SessionNotFound(self.id.clone()));
        }

        tracing::debug!(
            session_id = %self.id,
            client_id = %client.id(),
            stream = client.stream_id(),
            "client added to session"
        );
        self.keepalive();
        Ok(client)
    }

    /// Start delivery to every member client and re-arm the keepalive.
    pub fn play(self: &Arc<Self>) {
        let clients: Vec<Arc<Client>> = self.clients.lock().values().cloned().collect();
        for client in &clients {
            client.play();
        }
        tracing::debug!(session_id = %self.id, clients = clients.len(), "session playing");
        self.keepalive();
    }

    /// (Re)arm the inactivity timer. A pending timer is cancelled, so a
    /// session never has two.
    pub fn keepalive(self: &Arc<Self>) {
        let mut slot = self.keepalive.lock();
        if self.is_closed() {
            return;
        }

        let session = Arc::downgrade(self);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                tracing::info!(session_id = %session.id, "session keepalive expired");
                // close() aborts this timer, so it must not run inside it
                tokio::spawn(async move {
                    session.close().await;
                });
            }
        });

        if let Some(previous) = slot.replace(timer) {
            previous.abort();
        }
    }

    /// Close the session: cancel the timer, close every member client, then
    /// unregister the session id.
    ///
    /// Returns `false` when the session was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(timer) = self.keepalive.lock().take() {
            timer.abort();
        }

        let clients: Vec<Arc<Client>> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }

        if let Some(registry) = self.registry.upgrade() {
            let remaining = {
                let mut sessions = registry.write();
                sessions.remove(&self.id);
                sessions.len()
            };
            tracing::info!(session_id = %self.id, mount = %self.mount.path(), remaining, "session gone");
        }
        true
    }
}

/// Thread-safe registry of live subscriber sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<SessionMap>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create and register a session on the mount addressed by `request`.
    ///
    /// The request's `Authorization` header and hook context are kept on the
    /// session. No client is added yet.
    pub fn create_session(&self, mounts: &Mounts, request: &RtspRequest) -> Result<Arc<ClientWrapper>> {
        let mount = mounts
            .get_mount(&request.uri)
            .ok_or_else(|| RtspError::MountNotFound(request.uri.clone()))?;

        let session = Arc::new(ClientWrapper {
            id: new_id(),
            mount,
            registry: Arc::downgrade(&self.sessions),
            context: request.context.clone(),
            authorization: request.get_header("Authorization").unwrap_or_default().to_string(),
            clients: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(None),
            timeout: self.timeout,
            closed: AtomicBool::new(false),
        });

        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        tracing::info!(
            session_id = %session.id,
            mount = %session.mount.path(),
            total_sessions = total,
            "session created"
        );
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<ClientWrapper>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session (server shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<ClientWrapper>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}
