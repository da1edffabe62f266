//! A single downstream TCP client accepted by the [`super::FanoutSink`].

use std::io::{self, ErrorKind, Read, Write};

use mio::net::TcpStream;
use mio::Token;

/// One accepted plain-TCP client. Frames are written whole, one per
/// `send()` call — there is no RTP framing or retry on the downstream
/// side (§4.4).
pub struct ClientConnection {
    pub token: Token,
    stream: TcpStream,
    active: bool,
    discard_buf: [u8; 256],
    /// The `Reactor`'s own registration token for this connection's
    /// readability, set once `Supervisor` registers it (a separate
    /// namespace from `token` above, which only indexes the Sink's own
    /// client map).
    reactor_token: Option<Token>,
}

impl ClientConnection {
    pub fn new(token: Token, stream: TcpStream) -> Self {
        ClientConnection {
            token,
            stream,
            active: true,
            discard_buf: [0u8; 256],
            reactor_token: None,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_reactor_token(&mut self, token: Token) {
        self.reactor_token = Some(token);
    }

    pub fn reactor_token(&self) -> Option<Token> {
        self.reactor_token
    }

    /// Write `frame` in full. Any error, or a short write (the relay never
    /// retries a partial write — see `sink::fanout`), marks the connection
    /// inactive so the broadcast loop drops it after this pass completes.
    pub fn send_frame(&mut self, frame: &[u8]) {
        if !self.active {
            return;
        }
        match self.stream.write(frame) {
            Ok(n) if n == frame.len() => {}
            Ok(_) => {
                tracing::warn!("short write to downstream client, disconnecting");
                self.active = false;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::warn!("downstream client not keeping up, disconnecting");
                self.active = false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "write to downstream client failed, disconnecting");
                self.active = false;
            }
        }
    }

    /// Downstream clients never send anything meaningful; this relay reads
    /// and discards to notice disconnects (a `read()` of `0`, a hard error,
    /// or a single read that fills `discard_buf` outright, treated as the
    /// peer misusing a unidirectional protocol) rather than leaving the fd
    /// silently readable forever.
    pub fn drain_readable(&mut self) {
        loop {
            match self.stream.read(&mut self.discard_buf) {
                Ok(0) => {
                    self.active = false;
                    break;
                }
                Ok(n) if n == self.discard_buf.len() => {
                    tracing::warn!("downstream client sent unexpected data, disconnecting");
                    self.active = false;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.active = false;
                    break;
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
