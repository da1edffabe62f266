//! Reactor-driven RTSP control connection.
//!
//! Owns the non-blocking socket to the RTSP server, frames inbound bytes
//! into [`RtspResponse`]s (header block ends at `\r\n\r\n`, then
//! `Content-Length` bytes of body), and writes outbound [`RtspRequest`]s.
//! Mirrors the framing loop in the teacher's `transport/tcp.rs`
//! `Connection::run`, just reading responses instead of requests.

use std::io::{self, ErrorKind, Read, Write};
use std::net::ToSocketAddrs;

use mio::net::TcpStream;

use crate::error::{RelayError, Result};
use crate::rtsp::request::RtspRequest;
use crate::rtsp::response::RtspResponse;
use crate::transport::interleaved::{DemuxEvent, InterleavedDemux};

const READ_CHUNK: usize = 4096;

enum FrameState {
    Head,
    Body { partial: RtspResponse, needed: usize },
}

/// A connected (or connecting) RTSP control channel.
pub struct RtspClient {
    stream: TcpStream,
    read_buf: Vec<u8>,
    frame_state: FrameState,
    /// Set once `-t` is in effect (§10.12): RTP/RTCP share this socket with
    /// RTSP text, each `$`-prefixed. `None` means every byte read is RTSP
    /// text, which is the common case.
    demux: Option<InterleavedDemux>,
    interleaved_frames: Vec<(u8, Vec<u8>)>,
}

impl RtspClient {
    /// Resolve `host:port` and open a non-blocking TCP connection. The
    /// connect is asynchronous; the caller registers the returned stream's
    /// readiness (writable, then readable) with the [`crate::reactor::Reactor`].
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::InvalidUrl(format!("{host}:{port}")))?;
        let stream = TcpStream::connect(addr)?;
        Ok(RtspClient {
            stream,
            read_buf: Vec::new(),
            frame_state: FrameState::Head,
            demux: None,
            interleaved_frames: Vec::new(),
        })
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Switch this connection into interleaved mode: from now on, inbound
    /// bytes are demuxed before being handed to the response framer, and
    /// `$`-prefixed RTP/RTCP frames are queued for `take_interleaved_frames`.
    pub fn enable_interleaved(&mut self) {
        self.demux.get_or_insert_with(InterleavedDemux::default);
    }

    /// Drain RTP/RTCP frames demuxed off the control connection since the
    /// last call (channel, payload).
    pub fn take_interleaved_frames(&mut self) -> Vec<(u8, Vec<u8>)> {
        std::mem::take(&mut self.interleaved_frames)
    }

    pub fn send(&mut self, request: &RtspRequest) -> Result<()> {
        let bytes = request.serialize().into_bytes();
        self.stream.write_all(&bytes)?;
        Ok(())
    }

    /// Drain whatever is currently readable and return every complete
    /// response framed out of it. Call from the reactor's readable
    /// callback; an empty `Ok(vec![])` means "readable but not a full
    /// response yet", `Err` means the connection is unusable. When
    /// interleaved mode is on, also fills `interleaved_frames` as a side
    /// effect — call `take_interleaved_frames` afterward.
    pub fn read_responses(&mut self) -> Result<Vec<RtspResponse>> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut raw = Vec::new();
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(RelayError::Io(io::Error::from(ErrorKind::UnexpectedEof))),
                Ok(n) => raw.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(RelayError::Io(e)),
            }
        }

        if let Some(demux) = self.demux.as_mut() {
            demux.push(&raw);
            while let Some(event) = demux.next_event() {
                match event {
                    DemuxEvent::Rtsp(bytes) => self.read_buf.extend_from_slice(&bytes),
                    DemuxEvent::Frame { channel, data } => self.interleaved_frames.push((channel, data)),
                }
            }
        } else {
            self.read_buf.extend_from_slice(&raw);
        }

        self.frame_responses()
    }

    fn frame_responses(&mut self) -> Result<Vec<RtspResponse>> {
        let mut out = Vec::new();
        loop {
            match &self.frame_state {
                FrameState::Head => {
                    let Some(end) = find_header_end(&self.read_buf) else {
                        break;
                    };
                    let head = String::from_utf8_lossy(&self.read_buf[..end]).into_owned();
                    let (resp, needed) = RtspResponse::parse_head(&head)?;
                    self.read_buf.drain(..end);
                    if needed == 0 {
                        out.push(resp);
                        self.frame_state = FrameState::Head;
                    } else {
                        self.frame_state = FrameState::Body { partial: resp, needed };
                    }
                }
                FrameState::Body { needed, .. } => {
                    if self.read_buf.len() < *needed {
                        break;
                    }
                    let needed = *needed;
                    let FrameState::Body { partial, .. } =
                        std::mem::replace(&mut self.frame_state, FrameState::Head)
                    else {
                        unreachable!()
                    };
                    let body = String::from_utf8_lossy(&self.read_buf[..needed]).into_owned();
                    self.read_buf.drain(..needed);
                    out.push(partial.with_body(body));
                }
            }
        }
        Ok(out)
    }
}

/// Position just past the `\r\n\r\n` (or bare `\n\n`) that ends the header
/// block, if the buffer contains one yet.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4).or_else(|| {
        buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;

    #[test]
    fn frames_a_response_with_body_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf);
            sock.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 5\r\n\r\n").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
            sock.write_all(b"hello").unwrap();
        });

        let mut client = RtspClient::connect(&addr.ip().to_string(), addr.port()).unwrap();
        client
            .send(&RtspRequest::new("OPTIONS", "rtsp://x", 1))
            .unwrap();

        let mut responses = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while responses.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
            match client.read_responses() {
                Ok(r) => responses.extend(r),
                Err(_) => break,
            }
        }

        server.join().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].body.as_deref(), Some("hello"));
    }
}
