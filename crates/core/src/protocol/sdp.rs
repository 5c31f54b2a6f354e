//! Minimal SDP scanning (RFC 4566 / RFC 8866).
//!
//! The relay never interprets codecs; it only needs to know how many media
//! lines a publisher declared so a mount can hold one stream per line. The
//! body itself is stored verbatim and handed back to subscribers on DESCRIBE.
//!
//! ```text
//! v=0
//! o=- 0 0 IN IP4 127.0.0.1
//! s=Stream
//! t=0 0
//! m=video 0 RTP/AVP 96          ← media line 0
//! a=rtpmap:96 H264/90000
//! a=control:streamid=0
//! m=audio 0 RTP/AVP 97          ← media line 1
//! a=control:streamid=1
//! ```

/// One `m=` section of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    /// Media type from the `m=` line (`video`, `audio`, `application`, ...).
    pub kind: String,
    /// Value of the section's `a=control:` attribute, if any.
    pub control: Option<String>,
}

/// Collect the media sections of an SDP body in declaration order.
pub fn media_lines(sdp: &str) -> Vec<MediaLine> {
    let mut media: Vec<MediaLine> = Vec::new();

    for line in sdp.lines().map(str::trim) {
        if let Some(desc) = line.strip_prefix("m=") {
            let kind = desc.split_whitespace().next().unwrap_or("").to_string();
            media.push(MediaLine {
                kind,
                control: None,
            });
        } else if let Some(control) = line.strip_prefix("a=control:")
            && let Some(current) = media.last_mut()
        {
            current.control = Some(control.trim().to_string());
        }
    }

    tracing::trace!(count = media.len(), "scanned SDP media lines");
    media
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Stream\r\n\
        a=control:*\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:streamid=0\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n\
        a=control:streamid=1\r\n";

    #[test]
    fn finds_each_media_section() {
        let media = media_lines(SDP);
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].kind, "video");
        assert_eq!(media[0].control.as_deref(), Some("streamid=0"));
        assert_eq!(media[1].kind, "audio");
        assert_eq!(media[1].control.as_deref(), Some("streamid=1"));
    }

    #[test]
    fn session_level_control_is_ignored() {
        let media = media_lines("v=0\na=control:*\nm=video 0 RTP/AVP 96\n");
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].control, None);
    }

    #[test]
    fn empty_body_has_no_media() {
        assert!(media_lines("").is_empty());
    }
}
