//! TCP Fan-out Sink (§4.4): listens on a fixed port, accepts arbitrary
//! downstream clients, and broadcasts whole decoded frames to every live
//! one. No RTP framing downstream; the Annex-B start code for H.264
//! streams is prepended here, once per frame, guarded by `is_h264` — see
//! `broadcast` below.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use mio::Token;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::reactor::Reactor;
use crate::sink::client_connection::ClientConnection;

/// `listen()` backlog per §4.4's construction rules.
const LISTEN_BACKLOG: i32 = 20;
/// Minimum send buffer raised on the listener and every accepted client.
const MIN_SEND_BUFFER: usize = 50 * 1024;
/// RFC 6184 Annex-B start code, prepended to each frame when `is_h264`.
const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Listens on one TCP port and fans frames out to every accepted client.
///
/// `clients` is keyed by the sink's own id space (`next_client_id`), kept
/// separate from the `Reactor`'s `Token` namespace — each `ClientConnection`
/// additionally remembers the `Reactor` token it was registered under (see
/// `ClientConnection::reactor_token`) so it can be deregistered on
/// disconnect without the two id spaces colliding.
pub struct FanoutSink {
    listener: TcpListener,
    clients: HashMap<Token, ClientConnection>,
    next_client_id: usize,
    is_h264: bool,
}

impl FanoutSink {
    /// Binds per §4.4's construction rules: port-reuse disabled, send
    /// buffer raised to at least [`MIN_SEND_BUFFER`], `listen()` backlog of
    /// [`LISTEN_BACKLOG`]. `SIGPIPE` is not suppressed per-socket here — the
    /// Rust runtime already installs `SIG_IGN` for it at process startup, so
    /// a write to a dead peer surfaces as `EPIPE` rather than a signal.
    pub fn bind(port: u16, is_h264: bool) -> io::Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid socket addr");
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(false)?;
        socket.set_send_buffer_size(MIN_SEND_BUFFER)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into());
        Ok(FanoutSink {
            listener,
            clients: HashMap::new(),
            next_client_id: 0,
            is_h264,
        })
    }

    pub fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept every pending connection (readiness is edge-triggered),
    /// registering each one under a fresh client id and raising its send
    /// buffer. Returns the id/address of each newly accepted client so the
    /// caller can register it with the `Reactor` for readability (§4.4's
    /// client-side read handling).
    pub fn accept_pending(&mut self) -> io::Result<Vec<(Token, SocketAddr)>> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = SockRef::from(&stream).set_send_buffer_size(MIN_SEND_BUFFER) {
                        tracing::warn!(error = %e, %addr, "failed to raise downstream client's send buffer");
                    }
                    tracing::info!(%addr, "downstream client connected");
                    let id = Token(self.next_client_id);
                    self.next_client_id += 1;
                    self.clients.insert(id, ClientConnection::new(id, stream));
                    accepted.push((id, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }

    pub fn client_mut(&mut self, token: Token) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&token)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Broadcast `frame` to every active client, prepending the Annex-B
    /// start code once when `is_h264` (§4.4 step 2). Iterates a snapshot of
    /// tokens taken up front (§9: broadcast must not be invalidated by a
    /// client going inactive mid-loop); dead connections are compacted out
    /// once the whole pass is done, never during it.
    pub fn broadcast(&mut self, reactor: &mut Reactor, frame: &[u8]) {
        let payload: Cow<[u8]> = if self.is_h264 {
            let mut framed = Vec::with_capacity(ANNEX_B_START_CODE.len() + frame.len());
            framed.extend_from_slice(&ANNEX_B_START_CODE);
            framed.extend_from_slice(frame);
            Cow::Owned(framed)
        } else {
            Cow::Borrowed(frame)
        };

        let snapshot: Vec<Token> = self.clients.keys().copied().collect();
        for token in snapshot {
            if let Some(conn) = self.clients.get_mut(&token) {
                if conn.is_active() {
                    conn.send_frame(&payload);
                }
            }
        }
        self.compact_dead_clients(reactor);
    }

    pub fn is_h264(&self) -> bool {
        self.is_h264
    }

    fn compact_dead_clients(&mut self, reactor: &mut Reactor) {
        let dead: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, c)| !c.is_active())
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.clients.remove(&token) {
                if let Some(reactor_token) = conn.reactor_token() {
                    reactor.deregister(conn.stream_mut(), reactor_token);
                }
                conn.shutdown();
                tracing::info!("downstream client disconnected");
            }
        }
    }

    /// Drop a client immediately (used when its own read callback observes
    /// a half-close), deregistering it from the `Reactor` first.
    pub fn drop_client(&mut self, reactor: &mut Reactor, token: Token) {
        if let Some(mut conn) = self.clients.remove(&token) {
            if let Some(reactor_token) = conn.reactor_token() {
                reactor.deregister(conn.stream_mut(), reactor_token);
            }
            conn.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;

    #[test]
    fn broadcast_reaches_all_connected_clients() {
        let mut reactor = Reactor::new().unwrap();
        let mut sink = FanoutSink::bind(0, false).unwrap();
        let addr = sink.listener.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sink.accept_pending().unwrap();
        assert_eq!(sink.client_count(), 2);

        sink.broadcast(&mut reactor, b"frame1");
        let mut buf = [0u8; 6];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame1");
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame1");
    }

    #[test]
    fn h264_broadcast_prepends_start_code_once() {
        let mut reactor = Reactor::new().unwrap();
        let mut sink = FanoutSink::bind(0, true).unwrap();
        let addr = sink.listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sink.accept_pending().unwrap();

        sink.broadcast(&mut reactor, &[0x67, 0x01]);
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 1, 0x67, 0x01]);
    }

    #[test]
    fn dead_client_compacted_after_broadcast() {
        let mut reactor = Reactor::new().unwrap();
        let mut sink = FanoutSink::bind(0, false).unwrap();
        let addr = sink.listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sink.accept_pending().unwrap();
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));

        for _ in 0..5 {
            sink.broadcast(&mut reactor, b"x");
            if sink.client_count() == 0 {
                break;
            }
        }
        assert_eq!(sink.client_count(), 0);
    }
}
