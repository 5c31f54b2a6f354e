//! RTSP media relay.
//!
//! Publishers ANNOUNCE a path and RECORD RTP over UDP; players DESCRIBE,
//! SETUP and PLAY the same path and receive every publisher datagram,
//! unmodified, on their own UDP port pair.
//!
//! ```text
//! publisher ──RTP/RTCP──▶ RtspStream ──fan-out──▶ Client ──▶ player
//!                          (Mount)                (ClientWrapper session)
//! ```

pub mod client;
pub mod error;
pub mod mount;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::Client;
pub use error::{Result, RtspError};
pub use mount::{AnnouncePolicy, Hooks, Mount, MountInfo, Mounts, RtspStream};
pub use pool::PortPool;
pub use server::{Server, ServerConfig};
pub use session::{ClientWrapper, SessionManager};
