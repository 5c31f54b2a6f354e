use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::error::Result;
use crate::pool::PortPool;
use crate::transport::udp::bind_pair;

/// Largest datagram the relay accepts from a publisher.
const MAX_DATAGRAM: usize = 65_536;

/// Local ports a publisher is told to send one media line to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPorts {
    pub rtp_start_port: u16,
    pub rtp_end_port: u16,
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Rtp,
    Rtcp,
}

#[derive(Default)]
struct Relay {
    bound: Option<BoundPair>,
    tasks: Vec<JoinHandle<()>>,
}

struct BoundPair {
    rtp_port: u16,
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
}

/// One media line of a published mount.
///
/// Owns the publisher-facing RTP/RTCP sockets and the map of subscribed
/// clients. Every datagram the publisher sends is forwarded, unmodified and
/// in arrival order, to each open client in the map. There is no buffering.
///
/// Clients that are set up but not playing yet are only tracked weakly, so
/// [`close`](Self::close) can still reach them. They receive nothing.
pub struct RtspStream {
    id: u32,
    mount_path: String,
    pool: PortPool,
    bind_ip: IpAddr,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    pending: RwLock<HashMap<String, Weak<Client>>>,
    /// Held across socket binds so concurrent SETUP/RECORD bind only once.
    relay: tokio::sync::Mutex<Relay>,
    ports: Mutex<Option<StreamPorts>>,
}

impl RtspStream {
    pub fn new(id: u32, mount_path: &str, pool: PortPool, bind_ip: IpAddr) -> Self {
        Self {
            id,
            mount_path: mount_path.to_string(),
            pool,
            bind_ip,
            clients: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            relay: tokio::sync::Mutex::new(Relay::default()),
            ports: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Publisher-facing ports, once bound.
    pub fn ports(&self) -> Option<StreamPorts> {
        *self.ports.lock()
    }

    /// Lease a port pair and bind the publisher-facing sockets.
    ///
    /// Idempotent: a stream that is already bound returns its existing ports.
    pub async fn bind(&self) -> Result<StreamPorts> {
        let mut relay = self.relay.lock().await;
        self.bind_locked(&mut relay).await
    }

    async fn bind_locked(&self, relay: &mut Relay) -> Result<StreamPorts> {
        if let Some(bound) = &relay.bound {
            return Ok(StreamPorts {
                rtp_start_port: bound.rtp_port,
                rtp_end_port: bound.rtp_port + 1,
            });
        }

        let pair = bind_pair(&self.pool, self.bind_ip).await?;
        let ports = StreamPorts {
            rtp_start_port: pair.rtp_port,
            rtp_end_port: pair.rtcp_port(),
        };
        relay.bound = Some(BoundPair {
            rtp_port: pair.rtp_port,
            rtp: Arc::new(pair.rtp),
            rtcp: Arc::new(pair.rtcp),
        });
        *self.ports.lock() = Some(ports);

        tracing::info!(
            mount = %self.mount_path,
            stream = self.id,
            rtp_port = ports.rtp_start_port,
            rtcp_port = ports.rtp_end_port,
            "publisher relay bound"
        );
        Ok(ports)
    }

    /// Bind if needed and start forwarding publisher traffic. Safe to call
    /// repeatedly; an already running relay is left alone.
    pub async fn listen(self: &Arc<Self>) -> Result<StreamPorts> {
        let mut relay = self.relay.lock().await;
        let ports = self.bind_locked(&mut relay).await?;
        if !relay.tasks.is_empty() {
            return Ok(ports);
        }

        if let Some(bound) = &relay.bound {
            let rtp = spawn_forwarder(Arc::downgrade(self), bound.rtp.clone(), Channel::Rtp);
            let rtcp = spawn_forwarder(Arc::downgrade(self), bound.rtcp.clone(), Channel::Rtcp);
            relay.tasks = vec![rtp, rtcp];
        }
        tracing::debug!(mount = %self.mount_path, stream = self.id, "relay started");
        Ok(ports)
    }

    /// Stop forwarding, close the publisher sockets, then return the port
    /// pair to the pool.
    pub async fn stop_relay(&self) {
        let mut relay = self.relay.lock().await;
        for task in relay.tasks.drain(..) {
            task.abort();
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::debug!(error = %e, stream = self.id, "relay task ended abnormally");
            }
        }

        if let Some(bound) = relay.bound.take() {
            let port = bound.rtp_port;
            drop(bound);
            self.pool.return_rtp_port_to_pool(port);
            *self.ports.lock() = None;
            tracing::debug!(mount = %self.mount_path, stream = self.id, rtp_port = port, "publisher relay closed");
        }
    }

    /// Tear the stream down: stop the relay and close every client, playing
    /// or merely set up.
    pub async fn close(&self) {
        self.stop_relay().await;
        let mut clients: Vec<Arc<Client>> = self.clients.write().drain().map(|(_, c)| c).collect();
        clients.extend(self.pending.write().drain().filter_map(|(_, c)| c.upgrade()));
        for client in clients {
            client.close().await;
        }
    }

    /// Track a client that is set up but not yet playing.
    pub fn add_pending(&self, client: &Arc<Client>) {
        self.pending
            .write()
            .insert(client.id().to_string(), Arc::downgrade(client));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn add_client(&self, client: Arc<Client>) {
        let id = client.id().to_string();
        self.pending.write().remove(&id);
        self.clients.write().insert(id.clone(), client);
        tracing::debug!(mount = %self.mount_path, stream = self.id, client_id = %id, "client subscribed");
    }

    /// Drop `client_id` from the stream. Returns whether it was subscribed
    /// (playing); a pending entry is dropped silently.
    pub fn remove_client(&self, client_id: &str) -> bool {
        self.pending.write().remove(client_id);
        let removed = self.clients.write().remove(client_id).is_some();
        if removed {
            tracing::debug!(mount = %self.mount_path, stream = self.id, client_id, "client unsubscribed");
        }
        removed
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    /// Forward an RTP datagram to every subscribed client.
    pub fn forward_rtp(&self, buf: &[u8]) {
        for client in self.clients.read().values() {
            client.send_rtp(buf);
        }
    }

    /// Forward an RTCP datagram to every subscribed client.
    pub fn forward_rtcp(&self, buf: &[u8]) {
        for client in self.clients.read().values() {
            client.send_rtcp(buf);
        }
    }
}

fn spawn_forwarder(stream: Weak<RtspStream>, socket: Arc<UdpSocket>, channel: Channel) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _from)) => {
                    let Some(stream) = stream.upgrade() else {
                        break;
                    };
                    match channel {
                        Channel::Rtp => stream.forward_rtp(&buf[..len]),
                        Channel::Rtcp => stream.forward_rtcp(&buf[..len]),
                    }
                }
                // ICMP port-unreachable surfaces here on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::warn!(error = %e, ?channel, "publisher relay receive failed");
                    break;
                }
            }
        }
    })
}
