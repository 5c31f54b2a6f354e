use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::{RequestHandler, RtspRequest, RtspResponse};

/// Largest request body accepted (ANNOUNCE SDP).
const MAX_BODY: usize = 64 * 1024;

/// Accept RTSP connections until `shutdown` flips to `true`.
///
/// Each connection gets its own handler from `make_handler` and runs on its
/// own task.
pub async fn accept_loop<F, H>(listener: TcpListener, make_handler: F, mut shutdown: watch::Receiver<bool>)
where
    F: Fn(SocketAddr) -> H + Send + Sync + 'static,
    H: RequestHandler,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let handler = make_handler(peer_addr);
                    let shutdown = shutdown.clone();
                    tokio::spawn(Connection::handle(stream, peer_addr, handler, shutdown));
                }
                Err(e) => tracing::warn!(error = %e, "TCP accept error"),
            },
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP connection with its own lifecycle.
struct Connection<H> {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    handler: H,
    peer_addr: SocketAddr,
}

impl<H: RequestHandler> Connection<H> {
    async fn handle(stream: TcpStream, peer_addr: SocketAddr, handler: H, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(%peer_addr, "client connected");

        let (reader, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
            handler,
            peer_addr,
        };

        let reason = tokio::select! {
            reason = conn.run() => reason,
            _ = shutdown.changed() => "server shutting down",
        };
        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    async fn run(&mut self) -> &'static str {
        loop {
            let head = match self.read_head().await {
                Ok(Some(head)) => head,
                Ok(None) => return "connection closed by client",
                Err(_) => return "read error",
            };
            if head.trim().is_empty() {
                continue;
            }

            let response = match self.read_request(&head).await {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );
                    self.handler.handle(request).await
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    let response = RtspResponse::from_error(&e);
                    if let RtspError::Parse { kind } = &e
                        && kind.breaks_framing()
                    {
                        // the body cannot be skipped reliably; answer and hang up
                        let _ = self.writer.write_all(response.serialize().as_bytes()).await;
                        return "unframeable request body";
                    }
                    response
                }
            };

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");
            if self.writer.write_all(response.serialize().as_bytes()).await.is_err() {
                return "write error";
            }
        }
    }

    /// Read the request line and headers, up to and including the blank line.
    async fn read_head(&mut self) -> std::io::Result<Option<String>> {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let blank = line.trim_end_matches(['\r', '\n']).is_empty();
            if blank && head.is_empty() {
                // stray CRLF between pipelined requests
                continue;
            }
            head.push_str(&line);
            if blank {
                return Ok(Some(head));
            }
        }
    }

    async fn read_request(&mut self, head: &str) -> Result<RtspRequest> {
        let request = RtspRequest::parse(head)?.with_peer_addr(self.peer_addr);
        let length = request.content_length()?;
        if length > MAX_BODY {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::BodyTooLarge,
            });
        }
        if length == 0 {
            return Ok(request);
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        Ok(request.with_body(String::from_utf8_lossy(&body).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Ok200;

    #[async_trait]
    impl RequestHandler for Ok200 {
        async fn handle(&mut self, request: RtspRequest) -> RtspResponse {
            let cseq = request.cseq().unwrap_or("0").to_string();
            RtspResponse::ok().add_header("CSeq", &cseq)
        }
    }

    async fn serve() -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, |_| Ok200, rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn stray_crlf_between_requests_is_skipped() {
        let (addr, _shutdown) = serve().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n\r\nOPTIONS * RTSP/1.0\r\nCSeq: 2\r\n\r\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(stream);
        let mut statuses = Vec::new();
        let mut line = String::new();
        while statuses.len() < 2 {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            if line.starts_with("RTSP/1.0") {
                statuses.push(line.trim_end().to_string());
            }
        }
        assert_eq!(statuses, ["RTSP/1.0 200 OK", "RTSP/1.0 200 OK"]);
    }

    #[tokio::test]
    async fn oversized_body_is_refused_and_connection_closed() {
        let (addr, _shutdown) = serve().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let head = format!(
            "ANNOUNCE rtsp://h/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY + 1
        );
        stream.write_all(head.as_bytes()).await.unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("RTSP/1.0 413 Request Entity Too Large\r\n"), "{reply}");
        assert_eq!(reply.matches("RTSP/1.0").count(), 1);
    }
}
