//! Per-subsession UDP RTP reception (`-t` disabled, the default transport).
//!
//! One [`UdpTransport`] owns the RTP socket for a single subsession; RTCP
//! is accepted on `rtp_port + 1` but not parsed beyond recognizing a BYE
//! (§4.3's subsession-closed signal) — this relay only forwards media, it
//! is not an RTCP reporter.

use std::io::{self, ErrorKind};
use std::net::UdpSocket as StdUdpSocket;

use mio::net::UdpSocket;

const RECV_BUF_LEN: usize = 65536;

/// Bind a pair of ephemeral UDP ports `(rtp, rtp + 1)` for one subsession's
/// unicast transport, as advertised back to the server in the SETUP
/// request's `client_port=` parameter.
pub fn bind_client_ports() -> io::Result<(UdpSocket, UdpSocket, u16, u16)> {
    let rtp_std = StdUdpSocket::bind("0.0.0.0:0")?;
    let rtp_port = rtp_std.local_addr()?.port();
    rtp_std.set_nonblocking(true)?;

    // live555-style servers expect the RTCP port to be rtp_port + 1; retry
    // a few times if the kernel handed out an odd port or the +1 is taken.
    for _ in 0..8 {
        match StdUdpSocket::bind(format!("0.0.0.0:{}", rtp_port + 1)) {
            Ok(rtcp_std) => {
                rtcp_std.set_nonblocking(true)?;
                return Ok((
                    UdpSocket::from_std(rtp_std),
                    UdpSocket::from_std(rtcp_std),
                    rtp_port,
                    rtp_port + 1,
                ));
            }
            Err(_) => continue,
        }
    }
    Err(io::Error::new(ErrorKind::AddrInUse, "could not bind matching RTCP port"))
}

/// Read every datagram currently available on `socket`, handing each to
/// `on_packet`. Returns once the socket would block.
pub fn drain_datagrams(socket: &UdpSocket, mut on_packet: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buf = [0u8; RECV_BUF_LEN];
    loop {
        match socket.recv(&mut buf) {
            Ok(n) => on_packet(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// A minimal RTCP BYE detector: RFC 3550 §6.4.2, packet type 203.
pub fn is_rtcp_bye(packet: &[u8]) -> bool {
    packet.len() >= 2 && packet[1] == 203
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_adjacent_rtp_rtcp_ports() {
        let (_, _, rtp_port, rtcp_port) = bind_client_ports().unwrap();
        assert_eq!(rtcp_port, rtp_port + 1);
    }

    #[test]
    fn recognizes_rtcp_bye_packet_type() {
        let bye = [0x80, 203, 0, 1];
        assert!(is_rtcp_bye(&bye));
        let sr = [0x80, 200, 0, 1];
        assert!(!is_rtcp_bye(&sr));
    }
}
