//! H.264 depacketizer (RFC 6184): reassembles single-NAL and FU-A RTP
//! payloads into one access unit per frame, delimited by the RTP marker
//! bit. NAL units are concatenated raw; the leading Annex-B start code for
//! the whole frame is the Sink's job (`sink::fanout::broadcast`), so only
//! the boundary *between* multiple NAL units packed into one access unit
//! (e.g. a STAP-A carrying SPS+PPS+slice) is written here.
//!
//! The teacher's packetizer goes the other way (NAL → RTP); this mirrors
//! its single-writer contract-by-assertion style in [`FrameSource`].

use super::{FrameDelivered, FrameSource};
use crate::media::rtp::RtpHeader;

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_STAP_A: u8 = 24;

pub struct H264Source {
    current_access_unit: Vec<u8>,
    pending_frame: Option<Vec<u8>>,
    fua_in_progress: bool,
    closed: bool,
    request_pending: bool,
}

impl H264Source {
    pub fn new() -> Self {
        H264Source {
            current_access_unit: Vec::new(),
            pending_frame: None,
            fua_in_progress: false,
            closed: false,
            request_pending: false,
        }
    }

    fn append_single_nal(&mut self, nal: &[u8]) {
        if !self.current_access_unit.is_empty() {
            self.current_access_unit.extend_from_slice(&ANNEX_B_START_CODE);
        }
        self.current_access_unit.extend_from_slice(nal);
    }

    fn append_stap_a(&mut self, payload: &[u8]) {
        let mut offset = 0;
        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if offset + size > payload.len() {
                break;
            }
            self.append_single_nal(&payload[offset..offset + size]);
            offset += size;
        }
    }

    fn handle_fu_a(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = (fu_header & 0b1000_0000) != 0;
        let nal_type = fu_header & 0x1f;

        if start {
            let reconstructed_header = (indicator & 0b1110_0000) | nal_type;
            if !self.current_access_unit.is_empty() {
                self.current_access_unit.extend_from_slice(&ANNEX_B_START_CODE);
            }
            self.current_access_unit.push(reconstructed_header);
            self.fua_in_progress = true;
        }
        if self.fua_in_progress {
            self.current_access_unit.extend_from_slice(&payload[2..]);
        }
        // The end bit needs no special handling: the access unit still
        // closes on the RTP marker bit, matching `on_rtp_packet`'s caller.
    }

    /// Copy the ready frame into `on_delivered`'s buffer and clear it.
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

impl Default for H264Source {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for H264Source {
    fn on_rtp_packet(&mut self, packet: &[u8]) -> bool {
        let Some(header) = RtpHeader::parse(packet) else {
            return false;
        };
        if header.payload.is_empty() {
            return false;
        }

        let nal_type = header.payload[0] & 0x1f;
        match nal_type {
            NAL_TYPE_FU_A => self.handle_fu_a(header.payload),
            NAL_TYPE_STAP_A => self.append_stap_a(&header.payload[1..]),
            1..=23 => self.append_single_nal(header.payload),
            _ => {}
        }

        if header.marker && !self.current_access_unit.is_empty() {
            self.pending_frame = Some(std::mem::take(&mut self.current_access_unit));
            self.fua_in_progress = false;
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

    fn rtp_packet(marker: bool, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x80, if marker { 0xe0 } else { 0x60 }];
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&0u32.to_be_bytes());
        pkt.extend_from_slice(&1u32.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn single_nal_with_marker_produces_frame() {
        let mut source = H264Source::new();
        let nal = [0x67, 0x01, 0x02, 0x03]; // SPS, type 7
        let ready = source.on_rtp_packet(&rtp_packet(true, 1, &nal));
        assert!(ready);

        let mut buf = [0u8; 64];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(&buf[..d.frame_size], &[0x67, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn stap_a_with_two_nals_gets_internal_boundary_only() {
        let mut source = H264Source::new();
        let sps = [0x67, 0x01];
        let pps = [0x68, 0x02];
        let mut payload = vec![0u8; 0];
        payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&sps);
        payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&pps);
        // STAP-A NAL header (type 24) followed by the size-prefixed NALs above.
        let mut stap_payload = vec![24u8];
        stap_payload.extend_from_slice(&payload);

        assert!(source.on_rtp_packet(&rtp_packet(true, 1, &stap_payload)));
        let mut buf = [0u8; 64];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(&buf[..d.frame_size], &[0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02]);
    }

    #[test]
    fn fu_a_reassembles_into_one_nal() {
        let mut source = H264Source::new();
        // FU indicator: type 28, nri from original header; FU header start=1, type=5 (IDR slice)
        let start_payload = [28, 0b1000_0101, 0xAA, 0xBB];
        let mid_payload = [28, 0b0000_0101, 0xCC];
        let end_payload = [28, 0b0100_0101, 0xDD];

        assert!(!source.on_rtp_packet(&rtp_packet(false, 1, &start_payload)));
        assert!(!source.on_rtp_packet(&rtp_packet(false, 2, &mid_payload)));
        assert!(source.on_rtp_packet(&rtp_packet(true, 3, &end_payload)));

        let mut buf = [0u8; 64];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(&buf[..d.frame_size], &[0x65, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn oversized_frame_is_truncated() {
        let mut source = H264Source::new();
        let nal = [0x67; 10];
        source.on_rtp_packet(&rtp_packet(true, 1, &nal));

        let mut buf = [0u8; 6];
        let mut delivered = None;
        source.request_frame(&mut buf, &mut |d| delivered = Some(d), &mut || {});
        let d = delivered.unwrap();
        assert_eq!(d.frame_size, 6);
        assert_eq!(d.truncated_bytes, 10 - 6);
    }

    #[test]
    fn empty_access_unit_does_not_signal_ready() {
        let mut source = H264Source::new();
        assert!(!source.on_rtp_packet(&rtp_packet(true, 1, &[])));
    }
}
