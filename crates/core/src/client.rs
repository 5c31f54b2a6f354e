use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{Result, RtspError};
use crate::mount::stream::RtspStream;
use crate::mount::{Mount, MountInfo, MountState};
use crate::pool::PortPool;
use crate::protocol::RtspRequest;
use crate::session::new_id;
use crate::session::transport::TransportHeader;
use crate::transport::udp::bind_pair;

/// Receive buffer for subscriber RTCP (receiver reports are small).
const RTCP_BUFFER: usize = 2048;

struct ClientSockets {
    rtp_port: u16,
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
}

/// One subscriber's relay endpoint for a single media line.
///
/// A client owns a dedicated local RTP/RTCP socket pair leased from the
/// [`PortPool`] and sends forwarded publisher traffic to the subscriber's
/// declared `client_port` pair.
///
/// The same `Arc<Client>` is held by its [`RtspStream`] (for forwarding,
/// once playing) and by its [`ClientWrapper`](crate::session::ClientWrapper)
/// (for lifecycle). [`close`](Self::close) clears it from the stream; the
/// session clears its own map before closing members.
///
/// `open` is the only state shared between the forwarding path and teardown.
/// Sends after close are dropped silently.
pub struct Client {
    id: String,
    open: AtomicBool,
    mount: Weak<Mount>,
    mount_path: String,
    stream: Weak<RtspStream>,
    stream_id: u32,
    pool: PortPool,
    bind_ip: IpAddr,
    remote_addr: IpAddr,
    remote_rtp_port: u16,
    remote_rtcp_port: u16,
    sockets: Mutex<Option<ClientSockets>>,
    rtcp_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Validate a subscriber SETUP against `mount` and build the client.
    ///
    /// No ports are leased until [`setup`](Self::setup).
    pub fn new(mount: &Arc<Mount>, request: &RtspRequest) -> Result<Self> {
        let info = MountInfo::from_uri(&request.uri);
        if mount.path() != info.path {
            return Err(RtspError::MountMismatch {
                mount: mount.path().to_string(),
                requested: info.path,
            });
        }

        if mount.state() == MountState::TornDown {
            return Err(RtspError::MountNotFound(mount.path().to_string()));
        }

        let (peer, transport) = match (request.peer_addr, request.get_header("Transport")) {
            (Some(peer), Some(transport)) => (peer, transport),
            _ => {
                return Err(RtspError::MalformedRequest(
                    "no remote address or Transport header".into(),
                ));
            }
        };

        let ports = TransportHeader::parse(transport).ok_or_else(|| {
            RtspError::MalformedRequest(format!("no client_port pair in Transport: {transport}"))
        })?;

        let stream = mount
            .stream(info.stream_id)
            .ok_or_else(|| RtspError::StreamNotFound {
                path: info.path.clone(),
                stream: info.stream_id,
            })?;

        Ok(Self {
            id: new_id(),
            open: AtomicBool::new(true),
            mount: Arc::downgrade(mount),
            mount_path: info.path,
            stream: Arc::downgrade(&stream),
            stream_id: info.stream_id,
            pool: mount.pool().clone(),
            bind_ip: mount.bind_ip(),
            remote_addr: normalize_ip(peer.ip()),
            remote_rtp_port: ports.client_rtp_port,
            remote_rtcp_port: ports.client_rtcp_port,
            sockets: Mutex::new(None),
            rtcp_listener: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    pub fn remote_rtp_port(&self) -> u16 {
        self.remote_rtp_port
    }

    pub fn remote_rtcp_port(&self) -> u16 {
        self.remote_rtcp_port
    }

    /// Local RTP port, once [`setup`](Self::setup) has bound it.
    pub fn rtp_server_port(&self) -> Option<u16> {
        self.sockets.lock().as_ref().map(|s| s.rtp_port)
    }

    /// Local RTCP port; always `rtp_server_port + 1`.
    pub fn rtcp_server_port(&self) -> Option<u16> {
        self.rtp_server_port().map(|p| p + 1)
    }

    /// Lease a local port pair and bind both sockets.
    ///
    /// Port conflicts are retried on a fresh pair by
    /// [`bind_pair`]; any other bind failure is returned.
    pub async fn setup(&self) -> Result<()> {
        if self.sockets.lock().is_some() {
            return Ok(());
        }

        let pair = bind_pair(&self.pool, self.bind_ip).await?;
        let rtp_port = pair.rtp_port;

        if !self.is_open() {
            // closed while binding: nothing else will release this lease
            drop(pair);
            self.pool.return_rtp_port_to_pool(rtp_port);
            return Err(RtspError::SessionNotFound(self.id.clone()));
        }

        *self.sockets.lock() = Some(ClientSockets {
            rtp_port,
            rtp: Arc::new(pair.rtp),
            rtcp: Arc::new(pair.rtcp),
        });

        tracing::debug!(
            client_id = %self.id,
            mount = %self.mount_path,
            stream = self.stream_id,
            local_rtp = rtp_port,
            local_rtcp = rtp_port + 1,
            remote = %self.remote_addr,
            remote_rtp = self.remote_rtp_port,
            remote_rtcp = self.remote_rtcp_port,
            "client set up"
        );
        Ok(())
    }

    /// Call `on_packet` for every datagram the subscriber sends to the local
    /// RTCP port (receiver reports double as liveliness signals).
    ///
    /// Does nothing before [`setup`](Self::setup).
    pub fn listen_rtcp<F>(&self, on_packet: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let Some(socket) = self.sockets.lock().as_ref().map(|s| s.rtcp.clone()) else {
            return;
        };
        let client_id = self.id.clone();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; RTCP_BUFFER];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok(_) => on_packet(),
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        tracing::debug!(%client_id, error = %e, "RTCP listener stopped");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.rtcp_listener.lock().replace(task) {
            previous.abort();
        }
    }

    /// Register with the stream as set up but not playing, so a mount
    /// teardown also closes this client.
    ///
    /// Fails with `MountNotFound` when the mount was torn down meanwhile; the
    /// caller must then close the client.
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        if let Some(stream) = self.stream.upgrade() {
            stream.add_pending(self);
        }
        match self.mount.upgrade() {
            Some(mount) if mount.state() != MountState::TornDown => Ok(()),
            _ => Err(RtspError::MountNotFound(self.mount_path.clone())),
        }
    }

    /// Attach to the stream's subscriber map so forwarded traffic reaches
    /// this client.
    pub fn play(self: &Arc<Self>) {
        if !self.is_open() {
            return;
        }
        if let Some(stream) = self.stream.upgrade() {
            stream.add_client(self.clone());
        }
    }

    pub fn send_rtp(&self, buf: &[u8]) {
        self.send(buf, true);
    }

    pub fn send_rtcp(&self, buf: &[u8]) {
        self.send(buf, false);
    }

    fn send(&self, buf: &[u8], rtp: bool) {
        if !self.is_open() {
            return;
        }
        let sockets = self.sockets.lock();
        let Some(sockets) = sockets.as_ref() else {
            return;
        };

        let (socket, port) = if rtp {
            (&sockets.rtp, self.remote_rtp_port)
        } else {
            (&sockets.rtcp, self.remote_rtcp_port)
        };
        // A full send buffer drops the datagram; the relay never queues.
        if let Err(e) = socket.try_send_to(buf, SocketAddr::new(self.remote_addr, port)) {
            tracing::trace!(client_id = %self.id, error = %e, rtp, "send dropped");
        }
    }

    /// Detach from the mount, close both sockets, then return the leased
    /// port pair. Safe to call more than once.
    pub async fn close(&self) {
        self.open.store(false, Ordering::Release);

        match self.mount.upgrade() {
            Some(mount) => mount.client_leave(self),
            None => {
                if let Some(stream) = self.stream.upgrade() {
                    stream.remove_client(&self.id);
                }
            }
        }

        let listener = self.rtcp_listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
            if let Err(e) = listener.await
                && !e.is_cancelled()
            {
                tracing::debug!(client_id = %self.id, error = %e, "RTCP listener ended abnormally");
            }
        }

        let sockets = self.sockets.lock().take();
        if let Some(sockets) = sockets {
            let port = sockets.rtp_port;
            drop(sockets);
            self.pool.return_rtp_port_to_pool(port);
            tracing::debug!(client_id = %self.id, mount = %self.mount_path, rtp_port = port, "client closed");
        }
    }
}

/// Strip the IPv4-mapped IPv6 prefix (`::ffff:a.b.c.d` → `a.b.c.d`).
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
