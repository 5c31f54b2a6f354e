use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, RtspError};
use crate::mount::{AnnouncePolicy, Hooks, Mounts};
use crate::pool::PortPool;
use crate::protocol::{PlayHandler, PublishHandler};
use crate::session::{DEFAULT_SESSION_TIMEOUT, SessionManager};
use crate::transport::tcp;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listener for publishers (ANNOUNCE/RECORD).
    pub publish_addr: SocketAddr,
    /// RTSP listener for players (DESCRIBE/PLAY).
    pub client_addr: SocketAddr,
    /// First port of the RTP/RTCP relay range.
    pub rtp_port_start: u16,
    /// Number of ports in the relay range.
    pub rtp_port_count: u16,
    /// IP every relay socket binds on.
    pub bind_ip: IpAddr,
    /// Subscriber inactivity timeout.
    pub session_timeout: Duration,
    /// Timeout advertised to publishers in the `Session` header.
    pub publish_session_timeout_secs: u64,
    pub announce_policy: AnnouncePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            publish_addr: SocketAddr::from(([0, 0, 0, 0], 5554)),
            client_addr: SocketAddr::from(([0, 0, 0, 0], 6554)),
            rtp_port_start: 10000,
            rtp_port_count: 10000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            publish_session_timeout_secs: 30,
            announce_policy: AnnouncePolicy::default(),
        }
    }
}

/// RTSP relay server.
///
/// Owns the mount registry (and with it the port pool) and the subscriber
/// session registry. Publishers and players connect on separate listeners;
/// [`transport::tcp`](crate::transport::tcp) runs their connections.
pub struct Server {
    config: Arc<ServerConfig>,
    mounts: Mounts,
    sessions: SessionManager,
    hooks: Hooks,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    publish_local: Option<SocketAddr>,
    client_local: Option<SocketAddr>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let pool = PortPool::with_count(config.rtp_port_start, config.rtp_port_count);
        let mounts = Mounts::new(pool)
            .with_policy(config.announce_policy)
            .with_bind_ip(config.bind_ip);
        let sessions = SessionManager::new(config.session_timeout);

        Self {
            config: Arc::new(config),
            mounts,
            sessions,
            hooks: Hooks::default(),
            shutdown: None,
            tasks: Vec::new(),
            publish_local: None,
            client_local: None,
        }
    }

    /// Install authentication, mount-check and event hooks. Takes effect
    /// for connections accepted after the next [`start`](Self::start).
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(RtspError::AlreadyRunning);
        }

        let publish = TcpListener::bind(self.config.publish_addr).await?;
        let client = TcpListener::bind(self.config.client_addr).await?;
        let publish_local = publish.local_addr()?;
        let client_local = client.local_addr()?;

        let (tx, rx) = watch::channel(false);

        let (mounts, hooks, config) = (self.mounts.clone(), self.hooks.clone(), self.config.clone());
        let publish_task = tokio::spawn(tcp::accept_loop(
            publish,
            move |peer| PublishHandler::new(mounts.clone(), hooks.clone(), config.clone(), peer),
            rx.clone(),
        ));

        let (mounts, sessions, hooks, config) = (
            self.mounts.clone(),
            self.sessions.clone(),
            self.hooks.clone(),
            self.config.clone(),
        );
        let client_task = tokio::spawn(tcp::accept_loop(
            client,
            move |peer| PlayHandler::new(mounts.clone(), sessions.clone(), hooks.clone(), config.clone(), peer),
            rx,
        ));

        self.shutdown = Some(tx);
        self.tasks = vec![publish_task, client_task];
        self.publish_local = Some(publish_local);
        self.client_local = Some(client_local);

        tracing::info!(
            publish = %publish_local,
            play = %client_local,
            rtp_ports = %format!(
                "{}-{}",
                self.config.rtp_port_start,
                self.config.rtp_port_start.saturating_add(self.config.rtp_port_count.saturating_sub(1))
            ),
            "RTSP relay listening"
        );
        Ok(())
    }

    /// Stop both listeners and their connections, then close every session
    /// and mount so all relay ports are released.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        tracing::info!("server stopping");

        let _ = shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "listener task ended abnormally");
            }
        }

        self.sessions.close_all().await;
        self.mounts.close_all().await;
        self.publish_local = None;
        self.client_local = None;
        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    pub fn mounts(&self) -> &Mounts {
        &self.mounts
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Bound publisher listener address (useful with port 0).
    pub fn publish_addr(&self) -> Result<SocketAddr> {
        self.publish_local.ok_or(RtspError::NotStarted)
    }

    /// Bound player listener address (useful with port 0).
    pub fn client_addr(&self) -> Result<SocketAddr> {
        self.client_local.ok_or(RtspError::NotStarted)
    }
}
