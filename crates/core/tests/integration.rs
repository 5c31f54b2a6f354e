//! Integration tests: a publisher ANNOUNCEs and RECORDs over one listener,
//! players DESCRIBE/SETUP/PLAY over the other, and RTP pushed by the
//! publisher arrives at the players' UDP ports.

use std::net::SocketAddr;
use std::time::Duration;

use rtsp::{Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=Camera\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:streamid=0\r\n";

struct RtspConn {
    stream: BufReader<TcpStream>,
    cseq: u32,
}

struct Response {
    status: u16,
    head: String,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    fn session_id(&self) -> String {
        self.header("Session")
            .and_then(|s| s.split(';').next())
            .unwrap_or_default()
            .to_string()
    }

    /// `(rtp, rtcp)` from `server_port=a-b` in the Transport header.
    fn server_ports(&self) -> (u16, u16) {
        let transport = self.header("Transport").expect("Transport header");
        let ports = transport
            .split(';')
            .find_map(|p| p.strip_prefix("server_port="))
            .expect("server_port");
        let (rtp, rtcp) = ports.split_once('-').unwrap();
        (rtp.parse().unwrap(), rtcp.parse().unwrap())
    }
}

impl RtspConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream: BufReader::new(stream),
            cseq: 0,
        }
    }

    async fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)], body: Option<&str>) -> Response {
        self.cseq += 1;
        let mut req = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            req.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(body) = body {
            req.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
        } else {
            req.push_str("\r\n");
        }
        self.stream.get_mut().write_all(req.as_bytes()).await.unwrap();

        timeout(Duration::from_secs(5), self.read_response())
            .await
            .expect("response timed out")
    }

    async fn read_response(&mut self) -> Response {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            assert!(self.stream.read_line(&mut line).await.unwrap() > 0, "connection closed");
            head.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }

        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status line");
        let mut response = Response {
            status,
            head,
            body: String::new(),
        };

        let expected_cseq = self.cseq.to_string();
        assert_eq!(response.header("CSeq"), Some(expected_cseq.as_str()));

        if let Some(len) = response.header("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await.unwrap();
            response.body = String::from_utf8(body).unwrap();
        }
        response
    }
}

async fn start_server(low: u16) -> Server {
    let mut server = Server::new(ServerConfig {
        publish_addr: "127.0.0.1:0".parse().unwrap(),
        client_addr: "127.0.0.1:0".parse().unwrap(),
        rtp_port_start: low,
        rtp_port_count: 40,
        bind_ip: "127.0.0.1".parse().unwrap(),
        ..ServerConfig::default()
    });
    server.start().await.expect("server start");
    server
}

/// ANNOUNCE + SETUP + RECORD; returns the publisher connection and the
/// relay's RTP port.
async fn publish(server: &Server, path: &str) -> (RtspConn, u16) {
    let mut publisher = RtspConn::connect(server.publish_addr().unwrap()).await;
    let uri = format!("rtsp://127.0.0.1{path}");

    let resp = publisher.request("OPTIONS", &uri, &[], None).await;
    assert_eq!(resp.status, 200);
    assert!(resp.header("Public").unwrap().contains("ANNOUNCE"));

    let resp = publisher
        .request("ANNOUNCE", &uri, &[("Content-Type", "application/sdp")], Some(SDP))
        .await;
    assert_eq!(resp.status, 200);
    let session = resp.session_id();
    assert!(resp.header("Session").unwrap().ends_with(";timeout=30"));

    let resp = publisher
        .request(
            "SETUP",
            &format!("{uri}/streamid=0"),
            &[("Transport", "RTP/AVP/UDP;unicast;client_port=7000-7001;mode=record")],
            None,
        )
        .await;
    assert_eq!(resp.status, 200);
    let (rtp, rtcp) = resp.server_ports();
    assert_eq!(rtcp, rtp + 1);
    assert_eq!(rtp % 2, 0);

    let resp = publisher
        .request("RECORD", &uri, &[("Session", session.as_str()), ("Range", "npt=0.000-")], None)
        .await;
    assert_eq!(resp.status, 200);
    (publisher, rtp)
}

/// DESCRIBE + SETUP + PLAY towards `receiver`; returns the player connection
/// and its session id.
async fn play(server: &Server, path: &str, receiver: &UdpSocket) -> (RtspConn, String) {
    let mut player = RtspConn::connect(server.client_addr().unwrap()).await;
    let uri = format!("rtsp://127.0.0.1{path}");

    let resp = player.request("DESCRIBE", &uri, &[("Accept", "application/sdp")], None).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Type"), Some("application/sdp"));
    assert_eq!(resp.body, SDP);

    let port = receiver.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
    let resp = player
        .request("SETUP", &format!("{uri}/streamid=0"), &[("Transport", transport.as_str())], None)
        .await;
    assert_eq!(resp.status, 200);
    let session = resp.session_id();
    assert!(!session.is_empty());
    assert!(resp.header("Transport").unwrap().contains("server_port="));

    let resp = player.request("PLAY", &uri, &[("Session", session.as_str())], None).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Range"), Some("npt=0.000-"));
    (player, session)
}

async fn recv(socket: &UdpSocket, wait: Duration) -> Option<Vec<u8>> {
    let mut buf = [0u8; 2048];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => Some(buf[..n].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn publisher_rtp_reaches_player() {
    let mut server = start_server(43000).await;
    let (_publisher, relay_port) = publish(&server, "/stream1").await;

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_player, _session) = play(&server, "/stream1", &receiver).await;

    let mount = server.mounts().get_mount("rtsp://h/stream1").unwrap();
    assert_eq!(mount.stream_count(), 1);

    let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = [0x47u8; 188];
    source.send_to(&packet, ("127.0.0.1", relay_port)).await.unwrap();

    let got = recv(&receiver, Duration::from_secs(2)).await.expect("relayed RTP");
    assert_eq!(got, packet);

    server.stop().await;
    assert_eq!(server.mounts().pool().leased_count(), 0);
}

#[tokio::test]
async fn fan_out_skips_torn_down_players() {
    let mut server = start_server(43100).await;
    let (_publisher, relay_port) = publish(&server, "/cam").await;

    let staying = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let leaving = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_a, _) = play(&server, "/cam", &staying).await;
    let (mut b, session_b) = play(&server, "/cam", &leaving).await;
    assert_eq!(server.sessions().len(), 2);

    let resp = b.request("TEARDOWN", "rtsp://127.0.0.1/cam", &[("Session", session_b.as_str())], None).await;
    assert_eq!(resp.status, 200);
    assert_eq!(server.sessions().len(), 1);

    let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    source.send_to(b"rtp-after-teardown", ("127.0.0.1", relay_port)).await.unwrap();

    assert_eq!(
        recv(&staying, Duration::from_secs(2)).await.as_deref(),
        Some(&b"rtp-after-teardown"[..])
    );
    assert!(recv(&leaving, Duration::from_millis(300)).await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn publisher_teardown_closes_players() {
    let mut server = start_server(43200).await;
    let (mut publisher, _relay_port) = publish(&server, "/gone").await;

    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (mut player, session) = play(&server, "/gone", &receiver).await;
    let mount = server.mounts().get_mount("rtsp://h/gone").unwrap();

    let resp = publisher
        .request("TEARDOWN", "rtsp://127.0.0.1/gone", &[("Session", mount.id())], None)
        .await;
    assert_eq!(resp.status, 200);
    assert!(server.mounts().is_empty());
    assert_eq!(mount.stream(0).unwrap().client_count(), 0);

    // the player session's client is closed; its keepalive ends the session
    let resp = player.request("DESCRIBE", "rtsp://127.0.0.1/gone", &[], None).await;
    assert_eq!(resp.status, 404);
    let resp = player
        .request("TEARDOWN", "rtsp://127.0.0.1/gone", &[("Session", session.as_str())], None)
        .await;
    assert_eq!(resp.status, 200);

    server.stop().await;
    assert_eq!(server.mounts().pool().leased_count(), 0);
}

#[tokio::test]
async fn fan_out_skips_players_that_never_played() {
    let mut server = start_server(43300).await;
    let (_publisher, relay_port) = publish(&server, "/lobby").await;

    let playing = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_a, _) = play(&server, "/lobby", &playing).await;

    // SETUP only: the client is bound but not subscribed
    let idle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let idle_port = idle.local_addr().unwrap().port();
    let mut b = RtspConn::connect(server.client_addr().unwrap()).await;
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", idle_port, idle_port + 1);
    let resp = b
        .request(
            "SETUP",
            "rtsp://127.0.0.1/lobby/streamid=0",
            &[("Transport", transport.as_str())],
            None,
        )
        .await;
    assert_eq!(resp.status, 200);
    assert_eq!(server.sessions().len(), 2);

    let stream = server.mounts().get_mount("rtsp://h/lobby").unwrap().stream(0).unwrap();
    assert_eq!(stream.client_count(), 1);

    let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    source.send_to(b"only-for-players", ("127.0.0.1", relay_port)).await.unwrap();

    assert_eq!(
        recv(&playing, Duration::from_secs(2)).await.as_deref(),
        Some(&b"only-for-players"[..])
    );
    assert!(recv(&idle, Duration::from_millis(300)).await.is_none());

    server.stop().await;
    assert_eq!(server.mounts().pool().leased_count(), 0);
}
