//! The RTSP client state machine (§4.3).
//!
//! Continuation-passing (as live555's `continueAfterDESCRIBE` callback
//! chain works) is replaced by state+step: [`ClientEngine::on_response`]
//! takes the next response off the wire and returns the [`Action`]s the
//! `Supervisor` must carry out — send another request, (re)schedule a
//! timer, attach/detach a sink, or exit. The engine never touches a socket
//! or the reactor itself.

use std::time::Duration;

use crate::rtsp::auth::Authenticator;
use crate::rtsp::request::{self, RtspRequest};
use crate::rtsp::response::RtspResponse;
use crate::session::Session;

/// Protocol phase, exactly the five named in the source plus `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Describing,
    SettingUp(usize),
    Playing,
    TearingDown,
    Closed,
}

/// Identifies a scheduled timer so the `Supervisor` can map it back to a
/// real `reactor::TimerToken` (the engine itself never sees one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    KeepAlive,
    StreamDuration,
}

/// How a SETUP request should be parameterized, decided by the Supervisor
/// (it owns port allocation / interleaved-channel bookkeeping).
#[derive(Debug, Clone, Copy)]
pub enum SetupTransport {
    Udp { client_rtp: u16, client_rtcp: u16 },
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

/// What the `Supervisor` must do in response to an engine transition.
#[derive(Debug)]
pub enum Action {
    SendRequest(RtspRequest),
    ScheduleTimer { after: Duration, id: TimerKind },
    CancelTimer(TimerKind),
    AttachSink { subsession_index: usize },
    DetachSink { subsession_index: usize },
    Exit(i32),
}

#[derive(Debug)]
struct Pending {
    request: RtspRequest,
    retried: bool,
    subsession_index: Option<usize>,
}

/// Drives one RTSP session from `open()` through `Closed`.
pub struct ClientEngine {
    state: State,
    session: Session,
    request_uri: String,
    user_agent: String,
    tunnel_over_tcp: bool,
    keep_alive_enabled: bool,
    next_cseq: u64,
    pending: Option<Pending>,
    authenticator: Option<Authenticator>,
    keep_alive_primed: bool,
    closed_subsessions: Vec<bool>,
}

const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

impl ClientEngine {
    pub fn new(
        request_uri: String,
        user_agent: String,
        tunnel_over_tcp: bool,
        keep_alive_enabled: bool,
        credentials: Option<(String, String)>,
    ) -> Self {
        ClientEngine {
            state: State::Idle,
            session: Session::default(),
            request_uri,
            user_agent,
            tunnel_over_tcp,
            keep_alive_enabled,
            next_cseq: 1,
            pending: None,
            authenticator: credentials.map(|(u, p)| Authenticator::new(u, p)),
            keep_alive_primed: false,
            closed_subsessions: Vec::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tunnel_over_tcp(&self) -> bool {
        self.tunnel_over_tcp
    }

    fn next_cseq(&mut self) -> u64 {
        let c = self.next_cseq;
        self.next_cseq += 1;
        c
    }

    /// Emit the initial DESCRIBE and move to `Describing`.
    pub fn open(&mut self) -> Vec<Action> {
        let cseq = self.next_cseq();
        let req = request::describe(&self.request_uri, cseq, &self.user_agent);
        self.state = State::Describing;
        self.pending = Some(Pending {
            request: req.clone(),
            retried: false,
            subsession_index: None,
        });
        vec![Action::SendRequest(req)]
    }

    /// Main state-machine step: interpret the next inbound response.
    pub fn on_response(&mut self, resp: &RtspResponse) -> Vec<Action> {
        let Some(pending) = self.pending.as_ref() else {
            tracing::debug!(cseq = resp.cseq(), "response with no outstanding command, ignoring");
            return vec![];
        };

        if resp.cseq() != Some(pending.request.cseq) {
            tracing::debug!(
                expected = pending.request.cseq,
                got = ?resp.cseq(),
                "stray response with mismatched CSeq, ignoring"
            );
            return vec![];
        }

        if resp.is_auth_challenge() {
            return self.handle_auth_challenge(resp);
        }

        if !resp.is_success() {
            tracing::warn!(status = resp.status_code, method = pending.request.method, "RTSP request failed");
            return self.handle_failure();
        }

        match self.state.clone() {
            State::Describing => self.handle_describe_success(resp),
            State::SettingUp(i) => self.handle_setup_success(i, resp),
            State::Playing => self.handle_playing_success(resp),
            State::TearingDown => {
                self.state = State::Closed;
                vec![Action::Exit(0)]
            }
            State::Idle | State::Closed => vec![],
        }
    }

    fn handle_auth_challenge(&mut self, resp: &RtspResponse) -> Vec<Action> {
        let pending = self.pending.as_ref().unwrap();
        if pending.retried {
            tracing::warn!("authentication failed after retry");
            return vec![Action::Exit(1)];
        }
        let Some(authenticator) = self.authenticator.as_mut() else {
            tracing::warn!("server requires authentication but no credentials were supplied");
            return vec![Action::Exit(1)];
        };
        let Some(challenge) = resp
            .get_header("WWW-Authenticate")
            .or_else(|| resp.get_header("Proxy-Authenticate"))
        else {
            return vec![Action::Exit(1)];
        };
        if authenticator.update_challenge(challenge).is_err() {
            return vec![Action::Exit(1)];
        }

        let pending = self.pending.take().unwrap();
        let mut req = pending.request;
        let cseq = self.next_cseq();
        req.cseq = cseq;
        if let Some(auth_header) = authenticator.authorization_header(req.method, &req.uri) {
            req.headers.retain(|(k, _)| k != "Authorization");
            req = req.add_header("Authorization", auth_header);
        }
        self.pending = Some(Pending {
            request: req.clone(),
            retried: true,
            subsession_index: pending.subsession_index,
        });
        vec![Action::SendRequest(req)]
    }

    fn handle_failure(&mut self) -> Vec<Action> {
        match self.state {
            State::SettingUp(i) => self.skip_setup(i),
            State::TearingDown => {
                self.state = State::Closed;
                vec![Action::Exit(0)]
            }
            _ => vec![Action::Exit(1)],
        }
    }

    fn handle_describe_success(&mut self, resp: &RtspResponse) -> Vec<Action> {
        let Some(body) = resp.body.as_deref() else {
            return vec![Action::Exit(1)];
        };
        let sdp = match crate::rtsp::sdp::SessionDescription::parse(body) {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(error = %e, "malformed SDP in DESCRIBE response");
                return vec![Action::Exit(1)];
            }
        };
        let content_base = resp.get_header("Content-Base");
        self.session = Session::from_sdp(&sdp, &self.request_uri, content_base);
        if self.session.subsessions.is_empty() {
            return vec![Action::Exit(1)];
        }
        self.closed_subsessions = vec![false; self.session.subsessions.len()];
        self.state = State::SettingUp(0);
        self.pending = None;
        vec![]
    }

    /// Called by the Supervisor once it has decided the transport
    /// parameters for the subsession currently named by `State::SettingUp`.
    pub fn begin_setup(&mut self, index: usize, transport: SetupTransport) -> Vec<Action> {
        let uri = self.session.subsessions[index].control_url.clone();
        let cseq = self.next_cseq();
        let interleaved = match transport {
            SetupTransport::Interleaved { rtp_channel, rtcp_channel } => Some((rtp_channel, rtcp_channel)),
            SetupTransport::Udp { .. } => None,
        };
        let client_ports = match transport {
            SetupTransport::Udp { client_rtp, client_rtcp } => (client_rtp, client_rtcp),
            SetupTransport::Interleaved { .. } => (0, 0),
        };
        let req = request::setup(&uri, cseq, &self.user_agent, client_ports, interleaved);
        self.pending = Some(Pending {
            request: req.clone(),
            retried: false,
            subsession_index: Some(index),
        });
        vec![Action::SendRequest(req)]
    }

    /// Source port/channel allocation failed for the subsession at
    /// `index` (or its SETUP was rejected); skip it and advance.
    pub fn skip_setup(&mut self, index: usize) -> Vec<Action> {
        self.advance_setup(index)
    }

    fn handle_setup_success(&mut self, index: usize, resp: &RtspResponse) -> Vec<Action> {
        if let Some(session_id) = resp.session_id() {
            self.session.session_id = Some(session_id.to_string());
        }
        if let Some(timeout) = resp.session_timeout_secs() {
            self.session.timeout_secs = Some(timeout);
        }
        if let Some(transport) = resp.get_header("Transport") {
            if let Some(channels) = parse_interleaved_channels(transport) {
                self.session.subsessions[index].interleaved_channels = Some(channels);
            }
        }

        let mut actions = Vec::new();
        let subsession = &self.session.subsessions[index];
        if subsession.media.eq_ignore_ascii_case("video")
            && matches!(subsession.codec.as_str(), "H264" | "JPEG")
        {
            actions.push(Action::AttachSink { subsession_index: index });
        }

        actions.extend(self.advance_setup(index));
        actions
    }

    fn advance_setup(&mut self, index: usize) -> Vec<Action> {
        self.pending = None;
        let next = index + 1;
        if next < self.session.subsessions.len() {
            self.state = State::SettingUp(next);
            vec![]
        } else {
            self.begin_play()
        }
    }

    fn begin_play(&mut self) -> Vec<Action> {
        let Some(session_id) = self.session.session_id.clone() else {
            return vec![Action::Exit(1)];
        };
        let cseq = self.next_cseq();
        let range = self.session.abs_start_time.as_deref().unwrap_or("npt=0.000-");
        let req = request::play(&self.request_uri, cseq, &self.user_agent, &session_id, Some(range));
        self.state = State::Playing;
        self.pending = Some(Pending {
            request: req.clone(),
            retried: false,
            subsession_index: None,
        });
        vec![Action::SendRequest(req)]
    }

    fn handle_playing_success(&mut self, resp: &RtspResponse) -> Vec<Action> {
        // Either the PLAY response itself, or a later keep-alive OPTIONS response.
        let was_play = self.pending.as_ref().map(|p| p.request.method) == Some("PLAY");
        self.pending = None;
        if !was_play {
            return vec![];
        }
        if let Some(timeout) = resp.session_timeout_secs() {
            self.session.timeout_secs = Some(timeout);
        }
        let mut actions = Vec::new();
        if self.keep_alive_enabled {
            self.keep_alive_primed = false;
            actions.push(Action::ScheduleTimer {
                after: self.keep_alive_interval(),
                id: TimerKind::KeepAlive,
            });
        }
        if let Some(duration) = self.session.stream_duration {
            actions.push(Action::ScheduleTimer {
                after: duration,
                id: TimerKind::StreamDuration,
            });
        }
        actions
    }

    fn keep_alive_interval(&self) -> Duration {
        let timeout = self.session.timeout_secs.unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);
        Duration::from_secs(timeout.saturating_sub(5).max(1))
    }

    /// Called by the Supervisor when the keep-alive timer fires.
    pub fn keep_alive_fire(&mut self) -> Vec<Action> {
        if !matches!(self.state, State::Playing) {
            return vec![];
        }
        if !self.keep_alive_primed {
            self.keep_alive_primed = true;
            return vec![Action::ScheduleTimer {
                after: self.keep_alive_interval(),
                id: TimerKind::KeepAlive,
            }];
        }
        let cseq = self.next_cseq();
        let session_id = self.session.session_id.clone();
        let req = request::options(&self.request_uri, cseq, &self.user_agent, session_id.as_deref());
        self.pending = Some(Pending {
            request: req.clone(),
            retried: false,
            subsession_index: None,
        });
        vec![
            Action::SendRequest(req),
            Action::ScheduleTimer {
                after: self.keep_alive_interval(),
                id: TimerKind::KeepAlive,
            },
        ]
    }

    /// Called by the Supervisor when the stream-duration timer fires.
    pub fn stream_duration_fire(&mut self) -> Vec<Action> {
        self.begin_teardown()
    }

    /// Called when a subsession's frame source closes (natural end or an
    /// RTCP BYE observed on its transport).
    pub fn on_subsession_closed(&mut self, index: usize) -> Vec<Action> {
        if index >= self.closed_subsessions.len() || self.closed_subsessions[index] {
            return vec![];
        }
        self.closed_subsessions[index] = true;
        let mut actions = vec![Action::DetachSink { subsession_index: index }];
        if self.closed_subsessions.iter().all(|&c| c) {
            actions.extend(self.begin_teardown());
        }
        actions
    }

    /// Start orderly shutdown (Ctrl-C, natural end-of-stream).
    pub fn shutdown(&mut self) -> Vec<Action> {
        self.begin_teardown()
    }

    fn begin_teardown(&mut self) -> Vec<Action> {
        if matches!(self.state, State::TearingDown | State::Closed) {
            return vec![];
        }
        let mut actions = vec![Action::CancelTimer(TimerKind::KeepAlive), Action::CancelTimer(TimerKind::StreamDuration)];
        match self.session.session_id.clone() {
            Some(session_id) => {
                let cseq = self.next_cseq();
                let req = request::teardown(&self.request_uri, cseq, &self.user_agent, &session_id);
                self.state = State::TearingDown;
                self.pending = Some(Pending {
                    request: req.clone(),
                    retried: false,
                    subsession_index: None,
                });
                actions.push(Action::SendRequest(req));
            }
            None => {
                self.state = State::Closed;
                actions.push(Action::Exit(0));
            }
        }
        actions
    }
}

/// Parse `interleaved=N-M` out of a `Transport` header value.
fn parse_interleaved_channels(transport: &str) -> Option<(u8, u8)> {
    for part in transport.split(';') {
        if let Some(rest) = part.trim().strip_prefix("interleaved=") {
            let mut nums = rest.split('-');
            let rtp: u8 = nums.next()?.parse().ok()?;
            let rtcp: u8 = nums.next()?.parse().ok()?;
            return Some((rtp, rtcp));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response(cseq: u64, extra: &str) -> RtspResponse {
        let raw = format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra}\r\n");
        let (resp, _) = RtspResponse::parse_head(&raw).unwrap();
        resp
    }

    const SDP_BODY: &str = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:track1\r\n";

    #[test]
    fn describe_to_setting_up_to_playing_happy_path() {
        let mut engine = ClientEngine::new(
            "rtsp://host/stream".into(),
            "relay/0.1".into(),
            false,
            false,
            None,
        );
        let actions = engine.open();
        assert!(matches!(actions[0], Action::SendRequest(ref r) if r.method == "DESCRIBE"));
        assert_eq!(*engine.state(), State::Describing);

        let describe_cseq = 1;
        let raw = format!(
            "RTSP/1.0 200 OK\r\nCSeq: {describe_cseq}\r\nContent-Base: rtsp://host/stream/\r\nContent-Length: {}\r\n",
            SDP_BODY.len()
        );
        let (resp, _) = RtspResponse::parse_head(&raw).unwrap();
        let resp = resp.with_body(SDP_BODY.to_string());
        let actions = engine.on_response(&resp);
        assert!(actions.is_empty());
        assert_eq!(*engine.state(), State::SettingUp(0));

        let setup_actions = engine.begin_setup(0, SetupTransport::Udp { client_rtp: 6000, client_rtcp: 6001 });
        let Action::SendRequest(setup_req) = &setup_actions[0] else { panic!() };
        assert_eq!(setup_req.method, "SETUP");

        let setup_resp = ok_response(setup_req.cseq, "Session: ABC123;timeout=60\r\nTransport: RTP/AVP;unicast;client_port=6000-6001\r\n");
        let actions = engine.on_response(&setup_resp);
        assert!(actions.iter().any(|a| matches!(a, Action::AttachSink { subsession_index: 0 })));
        assert!(actions.iter().any(|a| matches!(a, Action::SendRequest(r) if r.method == "PLAY")));
        assert_eq!(*engine.state(), State::Playing);
    }

    #[test]
    fn auth_challenge_retried_once_then_fails() {
        let mut engine = ClientEngine::new(
            "rtsp://host/stream".into(),
            "relay/0.1".into(),
            false,
            false,
            Some(("user".into(), "pass".into())),
        );
        engine.open();
        let challenge = ok_response(1, "WWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n");
        let challenge = RtspResponse {
            status_code: 401,
            status_text: "Unauthorized".into(),
            ..challenge
        };
        let actions = engine.on_response(&challenge);
        let Action::SendRequest(retry) = &actions[0] else { panic!() };
        assert!(retry.headers.iter().any(|(k, _)| k == "Authorization"));

        let challenge2 = ok_response(retry.cseq, "WWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n");
        let challenge2 = RtspResponse {
            status_code: 401,
            status_text: "Unauthorized".into(),
            ..challenge2
        };
        let actions = engine.on_response(&challenge2);
        assert!(matches!(actions[0], Action::Exit(1)));
    }

    #[test]
    fn stray_cseq_is_ignored() {
        let mut engine = ClientEngine::new("rtsp://host/stream".into(), "ua".into(), false, false, None);
        engine.open();
        let stray = ok_response(999, "");
        assert!(engine.on_response(&stray).is_empty());
        assert_eq!(*engine.state(), State::Describing);
    }

    #[test]
    fn keep_alive_first_fire_does_not_send_options() {
        let mut engine = ClientEngine::new("rtsp://host/stream".into(), "ua".into(), false, true, None);
        engine.open();
        let raw = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Base: rtsp://host/stream/\r\nContent-Length: {}\r\n",
            SDP_BODY.len()
        );
        let (resp, _) = RtspResponse::parse_head(&raw).unwrap();
        engine.on_response(&resp.with_body(SDP_BODY.to_string()));
        let setup_actions = engine.begin_setup(0, SetupTransport::Udp { client_rtp: 6000, client_rtcp: 6001 });
        let Action::SendRequest(setup_req) = &setup_actions[0] else { panic!() };
        let setup_resp = ok_response(setup_req.cseq, "Session: ABC123;timeout=30\r\n");
        let actions = engine.on_response(&setup_resp);
        let Action::SendRequest(play_req) = actions.iter().find(|a| matches!(a, Action::SendRequest(r) if r.method == "PLAY")).unwrap() else { panic!() };
        let play_resp = ok_response(play_req.cseq, "");
        let actions = engine.on_response(&play_resp);
        assert!(actions.iter().any(|a| matches!(a, Action::ScheduleTimer { id: TimerKind::KeepAlive, .. })));

        let fire1 = engine.keep_alive_fire();
        assert!(!fire1.iter().any(|a| matches!(a, Action::SendRequest(r) if r.method == "OPTIONS")));
        let fire2 = engine.keep_alive_fire();
        assert!(fire2.iter().any(|a| matches!(a, Action::SendRequest(r) if r.method == "OPTIONS")));
    }

    #[test]
    fn bounded_range_schedules_stream_duration_timer_and_absolute_play() {
        let mut engine = ClientEngine::new("rtsp://host/stream".into(), "ua".into(), false, false, None);
        engine.open();
        let sdp_body = "v=0\r\na=range:npt=0-10\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:track1\r\n";
        let raw = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Base: rtsp://host/stream/\r\nContent-Length: {}\r\n",
            sdp_body.len()
        );
        let (resp, _) = RtspResponse::parse_head(&raw).unwrap();
        engine.on_response(&resp.with_body(sdp_body.to_string()));
        let setup_actions = engine.begin_setup(0, SetupTransport::Udp { client_rtp: 6000, client_rtcp: 6001 });
        let Action::SendRequest(setup_req) = &setup_actions[0] else { panic!() };
        let setup_resp = ok_response(setup_req.cseq, "Session: ABC123;timeout=60\r\n");
        let actions = engine.on_response(&setup_resp);
        let Action::SendRequest(play_req) = actions.iter().find(|a| matches!(a, Action::SendRequest(r) if r.method == "PLAY")).unwrap() else { panic!() };
        assert_eq!(play_req.headers.iter().find(|(k, _)| k == "Range").map(|(_, v)| v.as_str()), Some("npt=0.000-"));

        let play_resp = ok_response(play_req.cseq, "");
        let actions = engine.on_response(&play_resp);
        assert!(actions.iter().any(|a| matches!(a, Action::ScheduleTimer { id: TimerKind::StreamDuration, .. })));
    }
}
