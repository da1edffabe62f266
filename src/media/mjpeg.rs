//! MJPEG depacketizer (RFC 2435), producing complete JPEG images
//! (SOI/EOI-delimited, no Annex-B framing — that's an H.264-only concern).
//!
//! Simplified relative to the full RFC 2435 fragmentation header: this
//! relay only needs the fragment offset to detect the first packet of an
//! image and the RTP marker bit to detect the last, not quantization-table
//! rebuilding (cameras in this corpus's target fleet send baseline JPEG
//! with in-band tables, matching `onurtuna-OasisNvr`'s MJPEG path).

use super::{FrameDelivered, FrameSource};
use crate::media::rtp::RtpHeader;

const JPEG_HEADER_LEN: usize = 8;

pub struct MjpegSource {
    current_frame: Vec<u8>,
    pending_frame: Option<Vec<u8>>,
    closed: bool,
    request_pending: bool,
}

impl MjpegSource {
    pub fn new() -> Self {
        MjpegSource {
            current_frame: Vec::new(),
            pending_frame: None,
            closed: false,
            request_pending: false,
        }
    }

    fn deliver(&mut self, buffer: &mut [u8], on_delivered: &mut dyn FnMut(FrameDelivered)) {
        let Some(frame) = self.pending_frame.take() else {
            return;
        };
        let copy_len = frame.len().min(buffer.len());
        buffer[..copy_len].copy_from_slice(&frame[..copy_len]);
        on_delivered(FrameDelivered {
            frame_size: copy_len,
            truncated_bytes: frame.len() - copy_len,
            presentation_time_micros: 0,
        });
    }
}

impl Default for MjpegSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for MjpegSource {
    fn on_rtp_packet(&mut self, packet: &[u8]) -> bool {
        let Some(header) = RtpHeader::parse(packet) else {
            return false;
        };
        if header.payload.len() < JPEG_HEADER_LEN {
            return false;
        }

        // RFC 2435 §3.1: 3-byte fragment offset, big-endian, in bytes [1..4).
        let fragment_offset =
            u32::from_be_bytes([0, header.payload[1], header.payload[2], header.payload[3]]);
        if fragment_offset == 0 {
            self.current_frame.clear();
        }
        self.current_frame.extend_from_slice(&header.payload[JPEG_HEADER_LEN..]);

        if header.marker && !self.current_frame.is_empty() {
            self.pending_frame = Some(std::mem::take(&mut self.current_frame));
            true
        } else {
            false
        }
    }

    fn request_frame(
        &mut self,
        buffer: &mut [u8],
        on_delivered: &mut dyn FnMut(FrameDelivered),
        on_closed: &mut dyn FnMut(),
    ) {
        debug_assert!(!self.request_pending, "FrameSource::request_frame called with a request already outstanding");
        self.request_pending = true;

        if self.pending_frame.is_some() {
            self.deliver(buffer, on_delivered);
        } else if self.closed {
            on_closed();
        }
        self.request_pending = false;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_packet(marker: bool, seq: u16, fragment_offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x80, if marker { 0xda } else { 0x5a }];
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&0u32.to_be_bytes());
        pkt.extend_from_slice(&1u32.to_be_bytes());
        let off = fragment_offset.to_be_bytes();
        pkt.extend_from_slice(&[0, off[1], off[2], off[3]]);
        pkt.extend_from_slice(&[0, 0, 0, 0]); // type, q, width, height placeholders
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn single_fragment_image_ready_on_marker() {
        let mut source = MjpegSource::new();
        let ready = source.on_rtp_packet(&jpeg_packet(true, 1, 0, b"\xff\xd8imagedata\xff\xd9"));
        assert!(ready);

        let mut buf = [0u8; 64];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(&buf[..d.frame_size], &b"\xff\xd8imagedata\xff\xd9"[..]);
    }

    #[test]
    fn multi_fragment_image_reassembled() {
        let mut source = MjpegSource::new();
        assert!(!source.on_rtp_packet(&jpeg_packet(false, 1, 0, b"\xff\xd8abc")));
        assert!(source.on_rtp_packet(&jpeg_packet(true, 2, 3, b"def\xff\xd9")));

        let mut buf = [0u8; 64];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(&buf[..d.frame_size], &b"\xff\xd8abcdef\xff\xd9"[..]);
    }

    #[test]
    fn fragment_offset_zero_resets_in_progress_frame() {
        let mut source = MjpegSource::new();
        source.on_rtp_packet(&jpeg_packet(false, 1, 0, b"stale"));
        // A new image starting at offset 0 arrives before the previous one's marker.
        assert!(source.on_rtp_packet(&jpeg_packet(true, 2, 0, b"\xff\xd8fresh\xff\xd9")));

        let mut buf = [0u8; 64];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(&buf[..d.frame_size], &b"\xff\xd8fresh\xff\xd9"[..]);
    }
}
