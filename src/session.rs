//! Session/subsession data model (built from a DESCRIBE response's SDP).
//!
//! Grounded on the teacher's `session.rs`, which holds the equivalent
//! server-side bookkeeping (session id, per-subsession transport state);
//! `control_url` and `content_base` are additions this relay needs that the
//! distillation didn't carry over — SETUP requests must hit the absolute
//! per-track URL, resolved per RFC 2326 §C.1.1 against `Content-Base` (or
//! the original request URI if the server sent none).

use std::time::Duration;

use crate::rtsp::sdp::SessionDescription;
use crate::url::RtspUrl;

/// Slop added to a bounded NPT range's `(end - start)` before arming the
/// stream-duration timer, matching the original's `delaySlop`.
const STREAM_DURATION_SLOP: Duration = Duration::from_secs(2);

/// One media track advertised in the SDP, after its `a=control:` has been
/// resolved to an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsession {
    pub media: String,
    pub codec: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub control_url: String,
    /// Set once the matching SETUP response carries a usable `Transport`.
    pub interleaved_channels: Option<(u8, u8)>,
}

/// The full set of subsessions plus the session-wide bookkeeping needed to
/// keep issuing requests against the right URLs and `Session` id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub content_base: String,
    pub subsessions: Vec<Subsession>,
    pub session_id: Option<String>,
    pub timeout_secs: Option<u64>,
    /// `Range: clock=...` value to replay verbatim on PLAY, if the SDP
    /// advertised an absolute start time (`a=range:clock=...`).
    pub abs_start_time: Option<String>,
    /// Set when the SDP's `a=range:npt=start-end` has a finite `end`: the
    /// Supervisor arms a one-shot timer for this long after PLAY succeeds.
    pub stream_duration: Option<Duration>,
}

impl Session {
    /// Build a `Session` from a DESCRIBE response: `content_base` is the
    /// response's `Content-Base` header if present, else the original
    /// request URI (RFC 2326 §C.1.1); each subsession's `control_url` is
    /// resolved against it.
    pub fn from_sdp(sdp: &SessionDescription, request_uri: &str, content_base_header: Option<&str>) -> Self {
        let content_base = content_base_header.unwrap_or(request_uri).to_string();
        let url = RtspUrl {
            host: String::new(),
            port: 0,
            path: String::new(),
        };

        let subsessions = sdp
            .media
            .iter()
            .map(|m| {
                let control_url = match &m.control {
                    Some(control) => url.resolve(&content_base, control),
                    None => content_base.clone(),
                };
                Subsession {
                    media: m.media.clone(),
                    codec: m.codec.clone(),
                    payload_type: m.payload_type,
                    clock_rate: m.clock_rate,
                    control_url,
                    interleaved_channels: None,
                }
            })
            .collect();

        let (abs_start_time, stream_duration) = parse_range(sdp.range.as_deref());

        Session {
            content_base,
            subsessions,
            session_id: None,
            timeout_secs: None,
            abs_start_time,
            stream_duration,
        }
    }
}

/// Interpret an `a=range:` value (RFC 2326 §C.1.6). `clock=` ranges are
/// played back verbatim via `abs_start_time`; a bounded `npt=` range's
/// `(end - start)` becomes a stream-duration timer. An unbounded `npt=`
/// range (no `end`, e.g. `npt=0-`) yields neither.
fn parse_range(range: Option<&str>) -> (Option<String>, Option<Duration>) {
    let Some(range) = range else { return (None, None) };

    if let Some(rest) = range.strip_prefix("clock=") {
        let _ = rest;
        return (Some(range.to_string()), None);
    }

    if let Some(rest) = range.strip_prefix("npt=") {
        let mut parts = rest.splitn(2, '-');
        let start: Option<f64> = parts.next().and_then(|s| s.parse().ok());
        let end: Option<f64> = parts.next().filter(|s| !s.is_empty()).and_then(|s| s.parse().ok());
        if let (Some(start), Some(end)) = (start, end) {
            if end > start {
                return (None, Some(Duration::from_secs_f64(end - start) + STREAM_DURATION_SLOP));
            }
        }
    }

    (None, None)
}
