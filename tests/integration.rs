//! Full relay run against a mock RTSP/RTP peer: a background thread plays
//! an RTSP server and UDP sender, the relay is driven through
//! `supervisor::bootstrap` + `Reactor::run_once`, and a plain `TcpStream`
//! stands in for a downstream fan-out client.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rtsp_relay::config::Config;
use rtsp_relay::reactor::Reactor;
use rtsp_relay::supervisor;

fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn config_for(url: String, tcp_port: u16) -> Config {
    // `Config` has no public constructor beyond `from_args` (it parses the
    // CLI); tests build the struct directly since all its fields are pub.
    Config {
        tunnel_over_tcp: false,
        credentials: None,
        user_agent: "rtsp-relay-test/0.1".to_string(),
        tcp_server_port: tcp_port,
        keep_alive: false,
        verbose: false,
        rtsp_url: url,
    }
}

fn read_request(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = sock.read(&mut chunk).unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn cseq_of(req: &str) -> &str {
    req.lines()
        .find_map(|l| l.strip_prefix("CSeq: "))
        .unwrap()
        .trim()
}

const SDP_BODY: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=stream\r\nt=0 0\r\nm=video 0 RTP/AVP 26\r\na=control:track1\r\n";

/// Drives a single mock RTSP server handling DESCRIBE -> SETUP -> PLAY,
/// then sends one MJPEG frame over the negotiated UDP transport.
fn spawn_mock_server(listener: TcpListener) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();

        let describe = read_request(&mut sock);
        assert!(describe.starts_with("DESCRIBE"));
        let cseq = cseq_of(&describe);
        sock.write_all(
            format!(
                "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nContent-Base: rtsp://127.0.0.1/stream/\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
                SDP_BODY.len(),
                SDP_BODY
            )
            .as_bytes(),
        )
        .unwrap();

        let setup = read_request(&mut sock);
        assert!(setup.starts_with("SETUP"));
        let cseq = cseq_of(&setup);
        let client_port_line = setup
            .lines()
            .find(|l| l.starts_with("Transport:"))
            .unwrap()
            .to_string();
        let ports = client_port_line
            .split("client_port=")
            .nth(1)
            .unwrap()
            .trim()
            .split('-')
            .map(|p| p.parse::<u16>().unwrap())
            .collect::<Vec<_>>();
        let client_rtp_port = ports[0];

        sock.write_all(
            format!(
                "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: TESTSESSION;timeout=60\r\nTransport: RTP/AVP;unicast;client_port={}-{};server_port=7000-7001\r\n\r\n",
                ports[0], ports[1]
            )
            .as_bytes(),
        )
        .unwrap();

        let play = read_request(&mut sock);
        assert!(play.starts_with("PLAY"));
        let cseq = cseq_of(&play);
        sock.write_all(format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: TESTSESSION\r\n\r\n").as_bytes())
            .unwrap();

        // Send one complete MJPEG frame as a single RTP packet with the
        // marker bit set: fixed 12-byte header, 8-byte JPEG payload header
        // (type/q/width/height at indices 4..8), no payload bytes.
        let rtp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut packet = vec![0x80, 0x80 | 26, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1];
        packet.extend_from_slice(&[0, 0, 0, 0, 0, 16, 16, 0]);
        packet.extend_from_slice(b"\xff\xd8fake-jpeg-data\xff\xd9");
        rtp_socket
            .send_to(&packet, ("127.0.0.1", client_rtp_port))
            .unwrap();

        // Keep the connection open a bit so the relay has time to act on
        // the frame and the test's downstream client can read it.
        std::thread::sleep(Duration::from_millis(300));
    })
}

#[test]
fn relays_one_mjpeg_frame_to_a_downstream_tcp_client() {
    let rtsp_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let rtsp_addr = rtsp_listener.local_addr().unwrap();
    let server = spawn_mock_server(rtsp_listener);

    let tcp_port = free_tcp_port();
    let config = config_for(format!("rtsp://{}/stream", rtsp_addr), tcp_port);

    let mut reactor = Reactor::new().unwrap();
    let (supervisor, watch) = supervisor::bootstrap(&mut reactor, &config).unwrap();

    // Run the reactor until the sink's listener is up, then connect.
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut downstream = None;
    while downstream.is_none() && Instant::now() < deadline {
        reactor.run_once().unwrap();
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", tcp_port)) {
            downstream = Some(stream);
        }
    }
    let mut downstream = downstream.expect("sink never started listening");

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    downstream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    while received.is_empty() && Instant::now() < deadline {
        reactor.run_once().unwrap();
        let mut buf = [0u8; 4096];
        if let Ok(n) = downstream.read(&mut buf) {
            if n > 0 {
                received.extend_from_slice(&buf[..n]);
            }
        }
    }

    assert!(!received.is_empty(), "downstream client never received a frame");
    assert!(received.windows(2).any(|w| w == b"\xff\xd8"));

    watch.store(true, Ordering::SeqCst);
    server.join().unwrap();
    let _ = supervisor;
}

#[test]
fn describe_failure_drives_engine_to_exit_one() {
    let rtsp_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let rtsp_addr = rtsp_listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = rtsp_listener.accept().unwrap();
        let describe = read_request(&mut sock);
        let cseq = cseq_of(&describe);
        sock.write_all(format!("RTSP/1.0 404 Not Found\r\nCSeq: {cseq}\r\n\r\n").as_bytes())
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
    });

    let tcp_port = free_tcp_port();
    let config = config_for(format!("rtsp://{}/missing", rtsp_addr), tcp_port);

    let mut reactor = Reactor::new().unwrap();
    let (supervisor, watch) = supervisor::bootstrap(&mut reactor, &config).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while supervisor.borrow().exit_code().is_none() && Instant::now() < deadline {
        reactor.run_once().unwrap();
    }

    assert_eq!(supervisor.borrow().exit_code(), Some(1));
    watch.store(true, Ordering::SeqCst);
    server.join().unwrap();
}
