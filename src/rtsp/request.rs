//! Outbound RTSP requests (RFC 2326 §6).
//!
//! A builder, mirroring the teacher's `RtspResponse` builder pattern
//! (`add_header` / chain / `serialize`) but on the request side, since
//! this relay is the one issuing requests rather than answering them.

/// An RTSP request awaiting serialization.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: &'static str,
    pub uri: String,
    pub cseq: u64,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspRequest {
    pub fn new(method: &'static str, uri: impl Into<String>, cseq: u64) -> Self {
        RtspRequest {
            method,
            uri: uri.into(),
            cseq,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn add_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format, `CSeq` first (as every
    /// request in this protocol must carry one, RFC 2326 §12.17).
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} RTSP/1.0\r\n", self.method, self.uri);
        out.push_str(&format!("CSeq: {}\r\n", self.cseq));

        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }

        if let Some(body) = &self.body {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
            out.push_str("\r\n");
            out.push_str(body);
        } else {
            out.push_str("\r\n");
        }
        out
    }
}

/// `OPTIONS <uri> RTSP/1.0` — capability probe, also used as the
/// keep-alive request for broken servers (§4.3).
pub fn options(uri: &str, cseq: u64, user_agent: &str, session: Option<&str>) -> RtspRequest {
    let mut req = RtspRequest::new("OPTIONS", uri, cseq).add_header("User-Agent", user_agent);
    if let Some(id) = session {
        req = req.add_header("Session", id);
    }
    req
}

/// `DESCRIBE <uri> RTSP/1.0` — request the SDP session description.
pub fn describe(uri: &str, cseq: u64, user_agent: &str) -> RtspRequest {
    RtspRequest::new("DESCRIBE", uri, cseq)
        .add_header("User-Agent", user_agent)
        .add_header("Accept", "application/sdp")
}

/// `SETUP <uri> RTSP/1.0` for one subsession.
///
/// `client_ports` is the `(rtp, rtcp)` pair this relay listens on when not
/// tunnelling; ignored (the `Transport` line uses `interleaved=` instead)
/// when `interleaved_channels` is `Some`.
pub fn setup(
    uri: &str,
    cseq: u64,
    user_agent: &str,
    client_ports: (u16, u16),
    interleaved_channels: Option<(u8, u8)>,
) -> RtspRequest {
    let transport = match interleaved_channels {
        Some((rtp_ch, rtcp_ch)) => {
            format!("RTP/AVP/TCP;unicast;interleaved={rtp_ch}-{rtcp_ch}")
        }
        None => format!(
            "RTP/AVP;unicast;client_port={}-{}",
            client_ports.0, client_ports.1
        ),
    };

    RtspRequest::new("SETUP", uri, cseq)
        .add_header("User-Agent", user_agent)
        .add_header("Transport", transport)
}

/// `PLAY <uri> RTSP/1.0`.
///
/// `range` is `Some("clock=...")` for an absolute start time advertised by
/// the SDP, `Some("npt=0.000-")` for the ordinary relative case, or `None`
/// when the session carries no timing information worth restating.
pub fn play(uri: &str, cseq: u64, user_agent: &str, session_id: &str, range: Option<&str>) -> RtspRequest {
    let mut req = RtspRequest::new("PLAY", uri, cseq)
        .add_header("User-Agent", user_agent)
        .add_header("Session", session_id);
    if let Some(range) = range {
        req = req.add_header("Range", range);
    }
    req
}

/// `TEARDOWN <uri> RTSP/1.0`.
pub fn teardown(uri: &str, cseq: u64, user_agent: &str, session_id: &str) -> RtspRequest {
    RtspRequest::new("TEARDOWN", uri, cseq)
        .add_header("User-Agent", user_agent)
        .add_header("Session", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_describe() {
        let req = describe("rtsp://host/stream", 2, "relay/0.1");
        let s = req.serialize();
        assert!(s.starts_with("DESCRIBE rtsp://host/stream RTSP/1.0\r\n"));
        assert!(s.contains("CSeq: 2\r\n"));
        assert!(s.contains("Accept: application/sdp\r\n"));
        assert!(s.ends_with("\r\n\r\n") || s.ends_with("\r\n"));
    }

    #[test]
    fn setup_uses_client_port_when_udp() {
        let req = setup("rtsp://host/stream/track1", 3, "ua", (6000, 6001), None);
        let transport = req
            .headers
            .iter()
            .find(|(k, _)| k == "Transport")
            .unwrap()
            .1
            .clone();
        assert!(transport.contains("client_port=6000-6001"));
        assert!(!transport.contains("interleaved"));
    }

    #[test]
    fn setup_uses_interleaved_when_tunnelling() {
        let req = setup("rtsp://host/stream/track1", 3, "ua", (0, 0), Some((0, 1)));
        let transport = req
            .headers
            .iter()
            .find(|(k, _)| k == "Transport")
            .unwrap()
            .1
            .clone();
        assert!(transport.contains("interleaved=0-1"));
    }

    #[test]
    fn play_with_range_header() {
        let req = play("rtsp://host/stream", 4, "ua", "SESSIONID", Some("npt=0.000-"));
        assert!(req.serialize().contains("Range: npt=0.000-\r\n"));
    }
}
