//! Minimal SDP parser (RFC 2327 / RFC 4566), covering exactly the fields
//! this relay needs out of a DESCRIBE response body: the session
//! `Content-Base`/origin, per-media `m=` lines, and `a=control:`/`a=rtpmap:`
//! attributes.
//!
//! Hand-rolled in the spirit of `url.rs` — the corpus doesn't carry a full
//! SDP crate, and the grammar this relay consumes is narrow.

use crate::error::{RelayError, Result};

/// One `m=` block and its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
    pub control: Option<String>,
}

/// The parsed body of a DESCRIBE response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    /// Session-level `a=control:` attribute, if present.
    pub session_control: Option<String>,
    /// Session-level `a=range:` attribute, verbatim (e.g. `npt=0-30.500` or
    /// `clock=20230101T000000Z-20230101T000100Z`), if present.
    pub range: Option<String>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(body: &str) -> Result<Self> {
        let mut session_control = None;
        let mut range = None;
        let mut media = Vec::new();
        let mut current: Option<MediaDescription> = None;

        for raw_line in body.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let (kind, value) = (line.as_bytes()[0], &line[2..]);

            match kind {
                b'm' => {
                    if let Some(m) = current.take() {
                        media.push(m);
                    }
                    current = Some(parse_media_line(value)?);
                }
                b'a' => {
                    if let Some(rest) = value.strip_prefix("control:") {
                        match current.as_mut() {
                            Some(m) => m.control = Some(rest.to_string()),
                            None => session_control = Some(rest.to_string()),
                        }
                    } else if let Some(rest) = value.strip_prefix("rtpmap:") {
                        if let Some(m) = current.as_mut() {
                            apply_rtpmap(m, rest);
                        }
                    } else if let Some(rest) = value.strip_prefix("range:") {
                        if current.is_none() {
                            range = Some(rest.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(m) = current.take() {
            media.push(m);
        }

        if media.is_empty() {
            return Err(RelayError::MalformedSdp(
                "no m= media descriptions found".to_string(),
            ));
        }

        Ok(SessionDescription {
            session_control,
            range,
            media,
        })
    }
}

/// `m=video 0 RTP/AVP 96`
fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let mut fields = value.split_whitespace();
    let media = fields
        .next()
        .ok_or_else(|| RelayError::MalformedSdp(format!("empty m= line: {value}")))?
        .to_string();
    let _port = fields.next();
    let _proto = fields.next();
    let payload_type: u8 = fields
        .next()
        .ok_or_else(|| RelayError::MalformedSdp(format!("missing payload type: {value}")))?
        .parse()
        .map_err(|_| RelayError::MalformedSdp(format!("invalid payload type: {value}")))?;

    Ok(MediaDescription {
        media,
        payload_type,
        // Filled in by a later a=rtpmap: line if present; static payload
        // types (e.g. 26 = JPEG) fall back to RFC 3551 defaults below.
        codec: default_codec_for(payload_type),
        clock_rate: default_clock_rate_for(payload_type),
        control: None,
    })
}

/// `a=rtpmap:96 H264/90000`
fn apply_rtpmap(media: &mut MediaDescription, rest: &str) {
    let mut parts = rest.splitn(2, ' ');
    let Some(pt) = parts.next() else { return };
    if pt.parse::<u8>().ok() != Some(media.payload_type) {
        return;
    }
    let Some(encoding) = parts.next() else { return };
    let mut enc_parts = encoding.splitn(2, '/');
    if let Some(name) = enc_parts.next() {
        media.codec = name.to_uppercase();
    }
    if let Some(rate) = enc_parts.next() {
        let rate = rate.split('/').next().unwrap_or(rate);
        if let Ok(rate) = rate.parse() {
            media.clock_rate = rate;
        }
    }
}

fn default_codec_for(payload_type: u8) -> String {
    match payload_type {
        26 => "JPEG".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn default_clock_rate_for(payload_type: u8) -> u32 {
    match payload_type {
        26 => 90_000,
        _ => 90_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H264_SDP: &str = "\
v=0\r
o=- 0 0 IN IP4 127.0.0.1\r
s=No Name\r
c=IN IP4 0.0.0.0\r
t=0 0\r
a=control:*\r
m=video 0 RTP/AVP 96\r
a=rtpmap:96 H264/90000\r
a=control:track1\r
";

    const MJPEG_SDP: &str = "\
v=0\r
o=- 0 0 IN IP4 127.0.0.1\r
s=No Name\r
t=0 0\r
m=video 0 RTP/AVP 26\r
a=control:track1\r
";

    #[test]
    fn parses_h264_media() {
        let sdp = SessionDescription::parse(H264_SDP).unwrap();
        assert_eq!(sdp.session_control.as_deref(), Some("*"));
        assert_eq!(sdp.media.len(), 1);
        let m = &sdp.media[0];
        assert_eq!(m.media, "video");
        assert_eq!(m.payload_type, 96);
        assert_eq!(m.codec, "H264");
        assert_eq!(m.clock_rate, 90_000);
        assert_eq!(m.control.as_deref(), Some("track1"));
    }

    #[test]
    fn static_payload_type_defaults_without_rtpmap() {
        let sdp = SessionDescription::parse(MJPEG_SDP).unwrap();
        let m = &sdp.media[0];
        assert_eq!(m.codec, "JPEG");
        assert_eq!(m.clock_rate, 90_000);
    }

    #[test]
    fn rejects_sdp_with_no_media() {
        assert!(SessionDescription::parse("v=0\r\ns=x\r\n").is_err());
    }

    #[test]
    fn multiple_media_blocks_parsed_independently() {
        let sdp = "v=0\r\nm=audio 0 RTP/AVP 97\r\na=rtpmap:97 MPEG4-GENERIC/48000\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        let parsed = SessionDescription::parse(sdp).unwrap();
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(parsed.media[0].media, "audio");
        assert_eq!(parsed.media[1].media, "video");
    }
}
