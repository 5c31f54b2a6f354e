use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{Result, RtspError};
use crate::pool::PortPool;

/// An RTP/RTCP socket pair bound on a leased port pair.
///
/// The RTP port stays leased in the [`PortPool`] until the owner hands it
/// back with [`PortPool::return_rtp_port_to_pool`], which must happen only
/// after both sockets have been dropped.
#[derive(Debug)]
pub struct UdpPair {
    pub rtp_port: u16,
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

impl UdpPair {
    pub fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }
}

/// Lease a port pair and bind both sockets on `ip`.
///
/// When either bind fails with `EADDRINUSE` the partially bound pair is
/// dropped and the conflicting port stays leased while the next pair is
/// tried, so the lowest-first allocator never hands it back during this call.
/// Every conflicting port is returned once a pair binds or the pool runs dry
/// (`PortRangeExhausted`). Any other bind error is returned as-is after all
/// leases taken here are released.
pub async fn bind_pair(pool: &PortPool, ip: IpAddr) -> Result<UdpPair> {
    let mut conflicts = Vec::new();
    let result = loop {
        let Some(rtp_port) = pool.get_next_rtp_port() else {
            break Err(RtspError::PortRangeExhausted);
        };
        match bind_both(ip, rtp_port).await {
            Ok((rtp, rtcp)) => break Ok(UdpPair { rtp_port, rtp, rtcp }),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                tracing::warn!(rtp_port, conflicts = conflicts.len() + 1, "port pair in use, cycling to another");
                conflicts.push(rtp_port);
            }
            Err(e) => {
                pool.return_rtp_port_to_pool(rtp_port);
                break Err(e.into());
            }
        }
    };

    for port in conflicts {
        pool.return_rtp_port_to_pool(port);
    }
    result
}

async fn bind_both(ip: IpAddr, rtp_port: u16) -> std::io::Result<(UdpSocket, UdpSocket)> {
    let rtp = UdpSocket::bind(SocketAddr::new(ip, rtp_port)).await?;
    // On failure `rtp` is dropped here, closing the half-bound pair.
    let rtcp = UdpSocket::bind(SocketAddr::new(ip, rtp_port + 1)).await?;
    Ok((rtp, rtcp))
}
