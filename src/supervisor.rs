//! Session Supervisor (§4.5): glues the RTSP client engine to the TCP
//! fan-out sink.
//!
//! Owns everything with `Rc<RefCell<Supervisor>>` rather than raw
//! back-pointers (the original C++ stashes `this` in a subsession's
//! `miscPtr` and casts it back later) — reactor closures each hold a
//! clone of the `Rc` and borrow through the `RefCell` for the duration of
//! the callback, never across one. Single-threaded, so `Rc<RefCell<_>>`
//! stands in for the teacher's `Arc<Mutex<_>>`/`parking_lot` (there is
//! exactly one thread, so no atomic refcount or lock is needed).
//!
//! One sink per process, bound to the CLI's single `-p` port: the engine
//! may in principle see more than one video subsession whose codec
//! qualifies (§4.5), but there is only one downstream listen port to give
//! it, so the supervisor attaches the *first* qualifying subsession and
//! logs-and-skips any further one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::Token;

use crate::config::Config;
use crate::error::Result;
use crate::media::{FrameSource, H264Source, MjpegSource};
use crate::reactor::{Reactor, TimerToken};
use crate::rtsp::client::RtspClient;
use crate::rtsp::engine::{Action, ClientEngine, SetupTransport, State, TimerKind};
use crate::rtsp::response::RtspResponse;
use crate::sink::FanoutSink;
use crate::transport::udp;
use crate::url::RtspUrl;

/// Maximum bytes copied into the sink's scratch frame buffer per delivery
/// (§4.5's "1 MiB" constant); larger frames are delivered truncated.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

enum Source {
    H264(H264Source),
    Mjpeg(MjpegSource),
}

impl Source {
    fn as_frame_source(&mut self) -> &mut dyn FrameSource {
        match self {
            Source::H264(s) => s,
            Source::Mjpeg(s) => s,
        }
    }
}

struct MediaSlot {
    source: Source,
    rtp_socket: Option<mio::net::UdpSocket>,
    rtcp_socket: Option<mio::net::UdpSocket>,
}

struct SinkState {
    sink: FanoutSink,
    subsession_index: usize,
}

/// The glue object. See module docs for the `Rc<RefCell<_>>` ownership
/// rationale.
pub struct Supervisor {
    engine: ClientEngine,
    rtsp: RtspClient,
    media: HashMap<usize, MediaSlot>,
    sink: Option<SinkState>,
    timer_tokens: HashMap<TimerKind, TimerToken>,
    tcp_server_port: u16,
    watch: Arc<AtomicBool>,
    exit_code: Option<i32>,
    scratch: Vec<u8>,
}

impl Supervisor {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn request_exit(&mut self, code: i32) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
        self.watch.store(true, Ordering::SeqCst);
    }
}

/// Connect, build the engine, and send the initial DESCRIBE. The returned
/// `Supervisor` is driven entirely by reactor callbacks from here on;
/// `reactor.run(&watch)` is the caller's event loop.
pub fn bootstrap(reactor: &mut Reactor, config: &Config) -> Result<(Rc<RefCell<Supervisor>>, Arc<AtomicBool>)> {
    let watch = crate::reactor::install_shutdown_watch()?;
    let url = RtspUrl::parse(&config.rtsp_url)?;
    let mut rtsp = RtspClient::connect(&url.host, url.port)?;
    if config.tunnel_over_tcp {
        rtsp.enable_interleaved();
    }

    let engine = ClientEngine::new(
        config.rtsp_url.clone(),
        config.user_agent.clone(),
        config.tunnel_over_tcp,
        config.keep_alive,
        config.credentials.clone(),
    );

    let supervisor = Rc::new(RefCell::new(Supervisor {
        engine,
        rtsp,
        media: HashMap::new(),
        sink: None,
        timer_tokens: HashMap::new(),
        tcp_server_port: config.tcp_server_port,
        watch: watch.clone(),
        exit_code: None,
        scratch: vec![0u8; MAX_FRAME_BYTES],
    }));

    register_rtsp_readable(reactor, &supervisor)?;

    let actions = supervisor.borrow_mut().engine.open();
    dispatch(reactor, &supervisor, actions)?;

    Ok((supervisor, watch))
}

/// Begin orderly shutdown (e.g. on a signal already having flipped the
/// watch variable via `Reactor::run`'s own check — call this first if a
/// graceful TEARDOWN is wanted before the process actually exits).
pub fn shutdown(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>) {
    let actions = supervisor.borrow_mut().engine.shutdown();
    let _ = dispatch(reactor, supervisor, actions);
}

fn register_rtsp_readable(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>) -> Result<()> {
    let sup = supervisor.clone();
    reactor.register(
        supervisor.borrow_mut().rtsp.stream_mut(),
        Box::new(move |reactor| {
            let responses = sup.borrow_mut().rtsp.read_responses();
            match responses {
                Ok(responses) => {
                    for resp in responses {
                        handle_response(reactor, &sup, resp);
                    }
                    let frames = sup.borrow_mut().rtsp.take_interleaved_frames();
                    for (channel, data) in frames {
                        handle_interleaved_frame(reactor, &sup, channel, &data);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "RTSP control connection lost");
                    sup.borrow_mut().request_exit(1);
                }
            }
        }),
    )?;
    Ok(())
}

/// Route a `$`-prefixed interleaved frame (§10.12) to the subsession whose
/// RTP or RTCP channel number matches. Odd channels carry RTCP; only a BYE
/// is inspected on those, matching the UDP-transport RTCP handling.
fn handle_interleaved_frame(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>, channel: u8, data: &[u8]) {
    let index = {
        let sup = supervisor.borrow();
        sup.engine
            .session()
            .subsessions
            .iter()
            .position(|s| s.interleaved_channels.map(|(rtp, rtcp)| rtp == channel || rtcp == channel) == Some(true))
    };
    let Some(index) = index else { return };

    let is_rtcp = supervisor
        .borrow()
        .engine
        .session()
        .subsessions
        .get(index)
        .and_then(|s| s.interleaved_channels)
        .map(|(_, rtcp)| rtcp == channel)
        .unwrap_or(false);

    if is_rtcp {
        if udp::is_rtcp_bye(data) {
            let actions = supervisor.borrow_mut().engine.on_subsession_closed(index);
            let _ = dispatch(reactor, supervisor, actions);
        }
        return;
    }

    let frame_ready = {
        let mut sup = supervisor.borrow_mut();
        match sup.media.get_mut(&index) {
            Some(slot) => slot.source.as_frame_source().on_rtp_packet(data),
            None => false,
        }
    };
    if frame_ready {
        deliver_frame(reactor, supervisor, index);
    }
}

fn handle_response(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>, resp: RtspResponse) {
    let actions = supervisor.borrow_mut().engine.on_response(&resp);
    let _ = dispatch(reactor, supervisor, actions);
}

fn dispatch(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>, actions: Vec<Action>) -> Result<()> {
    for action in actions {
        match action {
            Action::SendRequest(req) => {
                let result = supervisor.borrow_mut().rtsp.send(&req);
                if let Err(e) = result {
                    tracing::warn!(error = %e, method = req.method, "failed to send RTSP request");
                    supervisor.borrow_mut().request_exit(1);
                }
            }
            Action::ScheduleTimer { after, id } => schedule_timer(reactor, supervisor, after, id),
            Action::CancelTimer(id) => {
                let token = supervisor.borrow_mut().timer_tokens.remove(&id);
                if let Some(token) = token {
                    reactor.cancel(token);
                }
            }
            Action::AttachSink { subsession_index } => attach_sink(reactor, supervisor, subsession_index)?,
            Action::DetachSink { subsession_index } => detach_sink(supervisor, subsession_index),
            Action::Exit(code) => supervisor.borrow_mut().request_exit(code),
        }
    }

    maybe_begin_next_setup(reactor, supervisor)?;
    Ok(())
}

/// After DESCRIBE (or a SETUP) advances the engine's `SettingUp(i)`
/// cursor, allocate transport for subsession `i` and send its SETUP.
/// Subsessions whose port allocation fails are skipped (§4.3).
fn maybe_begin_next_setup(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>) -> Result<()> {
    let index = {
        let sup = supervisor.borrow();
        match sup.engine.state() {
            State::SettingUp(i) if !sup.media.contains_key(i) => Some(*i),
            _ => None,
        }
    };
    let Some(index) = index else { return Ok(()) };

    let tunnel = supervisor.borrow().engine.tunnel_over_tcp();
    if tunnel {
        // Interleaved channels are just 2*i / 2*i+1; no socket to allocate,
        // so the media slot has no UDP sockets and RTP arrives demuxed off
        // the control connection (see `transport::interleaved`).
        let channels = ((index * 2) as u8, (index * 2 + 1) as u8);
        let source = default_source_for_index(supervisor, index);
        supervisor.borrow_mut().media.insert(
            index,
            MediaSlot {
                source,
                rtp_socket: None,
                rtcp_socket: None,
            },
        );
        let actions = supervisor
            .borrow_mut()
            .engine
            .begin_setup(index, SetupTransport::Interleaved { rtp_channel: channels.0, rtcp_channel: channels.1 });
        return dispatch(reactor, supervisor, actions);
    }

    match udp::bind_client_ports() {
        Ok((mut rtp_socket, mut rtcp_socket, rtp_port, rtcp_port)) => {
            reactor.register(&mut rtp_socket, rtp_readable_callback(supervisor.clone(), index))?;
            reactor.register(&mut rtcp_socket, rtcp_readable_callback(supervisor.clone(), index))?;
            let source = default_source_for_index(supervisor, index);
            supervisor.borrow_mut().media.insert(
                index,
                MediaSlot {
                    source,
                    rtp_socket: Some(rtp_socket),
                    rtcp_socket: Some(rtcp_socket),
                },
            );
            let actions = supervisor.borrow_mut().engine.begin_setup(
                index,
                SetupTransport::Udp { client_rtp: rtp_port, client_rtcp: rtcp_port },
            );
            dispatch(reactor, supervisor, actions)
        }
        Err(e) => {
            tracing::warn!(error = %e, subsession = index, "could not allocate client ports, skipping subsession");
            let actions = supervisor.borrow_mut().engine.skip_setup(index);
            dispatch(reactor, supervisor, actions)
        }
    }
}

fn default_source_for_index(supervisor: &Rc<RefCell<Supervisor>>, index: usize) -> Source {
    let codec = supervisor.borrow().engine.session().subsessions[index].codec.clone();
    if codec.eq_ignore_ascii_case("H264") {
        Source::H264(H264Source::new())
    } else {
        Source::Mjpeg(MjpegSource::new())
    }
}

fn rtp_readable_callback(supervisor: Rc<RefCell<Supervisor>>, index: usize) -> Box<dyn FnMut(&mut Reactor)> {
    Box::new(move |reactor| {
        let ready = {
            let mut sup = supervisor.borrow_mut();
            let mut frame_ready = false;
            if let Some(slot) = sup.media.get_mut(&index) {
                if let Some(socket) = slot.rtp_socket.take() {
                    let result = udp::drain_datagrams(&socket, |packet| {
                        if slot.source.as_frame_source().on_rtp_packet(packet) {
                            frame_ready = true;
                        }
                    });
                    slot.rtp_socket = Some(socket);
                    if let Err(e) = result {
                        tracing::warn!(error = %e, subsession = index, "RTP socket error");
                    }
                }
            }
            frame_ready
        };
        if ready {
            deliver_frame(reactor, &supervisor, index);
        }
    })
}

fn rtcp_readable_callback(supervisor: Rc<RefCell<Supervisor>>, index: usize) -> Box<dyn FnMut(&mut Reactor)> {
    Box::new(move |reactor| {
        let saw_bye = {
            let mut sup = supervisor.borrow_mut();
            let mut saw_bye = false;
            if let Some(slot) = sup.media.get_mut(&index) {
                if let Some(socket) = slot.rtcp_socket.take() {
                    let _ = udp::drain_datagrams(&socket, |packet| {
                        if udp::is_rtcp_bye(packet) {
                            saw_bye = true;
                        }
                    });
                    slot.rtcp_socket = Some(socket);
                }
            }
            saw_bye
        };
        if saw_bye {
            let actions = supervisor.borrow_mut().engine.on_subsession_closed(index);
            let _ = dispatch(reactor, &supervisor, actions);
        }
    })
}

/// Pull the next ready frame out of subsession `index`'s source (if it is
/// the one subsession currently attached to the sink) and broadcast it.
fn deliver_frame(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>, index: usize) {
    enum Outcome {
        Delivered { frame_size: usize, truncated: usize },
        Closed,
        NotAttached,
    }

    let outcome = {
        let mut sup = supervisor.borrow_mut();
        let is_attached = sup.sink.as_ref().map(|s| s.subsession_index) == Some(index);
        if !is_attached {
            Outcome::NotAttached
        } else {
            let Supervisor { media, scratch, .. } = &mut *sup;
            match media.get_mut(&index) {
                Some(slot) => {
                    let mut delivered = None;
                    let mut closed = false;
                    slot.source.as_frame_source().request_frame(
                        scratch,
                        &mut |d| delivered = Some(d),
                        &mut || closed = true,
                    );
                    match (closed, delivered) {
                        (true, _) => Outcome::Closed,
                        (false, Some(d)) => Outcome::Delivered { frame_size: d.frame_size, truncated: d.truncated_bytes },
                        (false, None) => Outcome::NotAttached,
                    }
                }
                None => Outcome::NotAttached,
            }
        }
    };

    match outcome {
        Outcome::Delivered { frame_size, truncated } => {
            if truncated > 0 {
                tracing::warn!(subsession = index, truncated_bytes = truncated, "frame exceeded sink buffer, truncated");
            }
            let mut sup = supervisor.borrow_mut();
            let frame: Vec<u8> = sup.scratch[..frame_size].to_vec();
            if let Some(sink_state) = sup.sink.as_mut() {
                sink_state.sink.broadcast(reactor, &frame);
            }
        }
        Outcome::Closed => {
            let actions = supervisor.borrow_mut().engine.on_subsession_closed(index);
            let _ = dispatch(reactor, supervisor, actions);
        }
        Outcome::NotAttached => {}
    }
}

fn attach_sink(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>, subsession_index: usize) -> Result<()> {
    if supervisor.borrow().sink.is_some() {
        tracing::info!(subsession = subsession_index, "a sink is already attached, ignoring additional video subsession");
        return Ok(());
    }

    let is_h264 = supervisor.borrow().engine.session().subsessions[subsession_index]
        .codec
        .eq_ignore_ascii_case("H264");
    let port = supervisor.borrow().tcp_server_port;

    let mut sink = FanoutSink::bind(port, is_h264)?;
    reactor.register(sink.listener_mut(), listener_callback(supervisor.clone()))?;

    supervisor.borrow_mut().sink = Some(SinkState { sink, subsession_index });
    Ok(())
}

fn listener_callback(supervisor: Rc<RefCell<Supervisor>>) -> Box<dyn FnMut(&mut Reactor)> {
    Box::new(move |reactor| {
        let accepted = {
            let mut sup = supervisor.borrow_mut();
            let Some(sink_state) = sup.sink.as_mut() else { return };
            match sink_state.sink.accept_pending() {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "error accepting downstream client");
                    return;
                }
            }
        };

        // Each accepted client registers for readability so a half-close
        // is noticed directly instead of only via a failed broadcast
        // `send()` (§4.4's client-side read handling).
        for (client_id, addr) in accepted {
            let callback = client_readable_callback(supervisor.clone(), client_id);
            let mut sup = supervisor.borrow_mut();
            let Some(sink_state) = sup.sink.as_mut() else { continue };
            let Some(conn) = sink_state.sink.client_mut(client_id) else { continue };
            match reactor.register(conn.stream_mut(), callback) {
                Ok(token) => conn.set_reactor_token(token),
                Err(e) => tracing::warn!(error = %e, %addr, "failed to register downstream client for readability"),
            }
        }
    })
}

/// Drains a downstream client's socket on readability (it never sends
/// anything meaningful) and drops it immediately on half-close or scratch
/// buffer overflow, ahead of the next broadcast (§4.4).
fn client_readable_callback(supervisor: Rc<RefCell<Supervisor>>, client_id: Token) -> Box<dyn FnMut(&mut Reactor)> {
    Box::new(move |reactor| {
        let is_dead = {
            let mut sup = supervisor.borrow_mut();
            let Some(sink_state) = sup.sink.as_mut() else { return };
            let Some(conn) = sink_state.sink.client_mut(client_id) else { return };
            conn.drain_readable();
            !conn.is_active()
        };
        if !is_dead {
            return;
        }
        let mut sup = supervisor.borrow_mut();
        if let Some(sink_state) = sup.sink.as_mut() {
            sink_state.sink.drop_client(reactor, client_id);
        }
    })
}

fn detach_sink(supervisor: &Rc<RefCell<Supervisor>>, subsession_index: usize) {
    let mut sup = supervisor.borrow_mut();
    if sup.sink.as_ref().map(|s| s.subsession_index) == Some(subsession_index) {
        sup.sink = None;
    }
    sup.media.remove(&subsession_index);
}

fn schedule_timer(reactor: &mut Reactor, supervisor: &Rc<RefCell<Supervisor>>, after: Duration, id: TimerKind) {
    let sup = supervisor.clone();
    let token = reactor.schedule_after(
        after,
        Box::new(move |reactor| {
            let actions = match id {
                TimerKind::KeepAlive => sup.borrow_mut().engine.keep_alive_fire(),
                TimerKind::StreamDuration => sup.borrow_mut().engine.stream_duration_fire(),
            };
            let _ = dispatch(reactor, &sup, actions);
        }),
    );
    supervisor.borrow_mut().timer_tokens.insert(id, token);
}
