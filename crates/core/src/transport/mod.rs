//! Network transport layer for RTSP signaling and RTP relay.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One task
//!   per connection, one listener per role (publish, play).
//!
//! - **UDP** ([`udp`]): carries RTP/RTCP. Every publisher media line and
//!   every subscriber client owns a dedicated even/odd port pair leased from
//!   the [`PortPool`](crate::pool::PortPool).

pub mod tcp;
pub mod udp;

pub use udp::{UdpPair, bind_pair};
