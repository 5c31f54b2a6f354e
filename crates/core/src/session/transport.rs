//! `Transport` header handling (RFC 2326 §12.39).
//!
//! Only unicast RTP over UDP is relayed. The player (or publisher) names its
//! own port pair in `client_port=`; the relay answers with the same header
//! plus the local pair it bound in `server_port=`:
//!
//! ```text
//! → Transport: RTP/AVP;unicast;client_port=8000-8001
//! ← Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=10000-10001
//! ```

/// The `client_port` pair a peer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub client_rtp_port: u16,
    pub client_rtcp_port: u16,
}

impl TransportHeader {
    /// Extract `client_port=RTP-RTCP` from a `Transport` header value.
    ///
    /// ```
    /// use rtsp::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!((th.client_rtp_port, th.client_rtcp_port), (8000, 8001));
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let ports = header
            .split(';')
            .find_map(|param| param.trim().strip_prefix("client_port="))?;
        let (rtp, rtcp) = ports.split_once('-')?;
        Some(Self {
            client_rtp_port: rtp.trim().parse().ok()?,
            client_rtcp_port: rtcp.trim().parse().ok()?,
        })
    }
}

/// Whether a `Transport` header asks for TCP (interleaved) delivery.
pub fn is_tcp(header: &str) -> bool {
    header.to_ascii_lowercase().contains("tcp")
}

/// Echo the requested transport with the relay's bound pair appended.
pub fn with_server_port(header: &str, rtp_port: u16, rtcp_port: u16) -> String {
    format!("{};server_port={rtp_port}-{rtcp_port}", header.trim_end_matches(';'))
}
