use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rtsp::{AnnouncePolicy, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Reannounce {
    /// Close the previous mount and its subscribers
    Teardown,
    /// Stop only the previous publisher; subscribers expire on their own
    Orphan,
}

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay: publishers push RTP over UDP, players pull it"
)]
struct Args {
    /// Listener for publishers (ANNOUNCE/RECORD)
    #[arg(long, default_value = "0.0.0.0:5554")]
    publish: SocketAddr,

    /// Listener for players (DESCRIBE/PLAY)
    #[arg(long, default_value = "0.0.0.0:6554")]
    play: SocketAddr,

    /// First UDP port of the relay range
    #[arg(long, default_value_t = 10000)]
    rtp_port_start: u16,

    /// Number of UDP ports in the relay range
    #[arg(long, default_value_t = 10000)]
    rtp_port_count: u16,

    /// IP the relay sockets bind on
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Player session inactivity timeout, in seconds
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Session timeout advertised to publishers, in seconds
    #[arg(long, default_value_t = 30)]
    publish_session_timeout: u64,

    /// What to do with an existing mount when its path is announced again
    #[arg(long, value_enum, default_value_t = Reannounce::Teardown)]
    reannounce: Reannounce,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            publish_addr: args.publish,
            client_addr: args.play,
            rtp_port_start: args.rtp_port_start,
            rtp_port_count: args.rtp_port_count,
            bind_ip: args.bind_ip,
            session_timeout: Duration::from_secs(args.session_timeout),
            publish_session_timeout_secs: args.publish_session_timeout,
            announce_policy: match args.reannounce {
                Reannounce::Teardown => AnnouncePolicy::TeardownPrevious,
                Reannounce::Orphan => AnnouncePolicy::OrphanSubscribers,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut server = Server::new(args.into());

    if let Err(e) = server.start().await {
        tracing::error!(error = %e, "failed to start server");
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
    }

    server.stop().await;
    ExitCode::SUCCESS
}
