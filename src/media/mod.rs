//! Frame Source interface (§4.2) and its two depacketizing implementations.
//!
//! Grounded on the teacher's `rtp::Packetizer` trait (`crates/core/src/rtp`),
//! whose single-writer contract this mirrors in the opposite direction:
//! instead of handing the caller packets to send, a `FrameSource` hands the
//! caller complete frames it has reassembled from incoming RTP.

pub mod h264;
pub mod mjpeg;
pub mod rtp;

pub use h264::H264Source;
pub use mjpeg::MjpegSource;

/// What a completed frame delivery reports back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDelivered {
    pub frame_size: usize,
    pub truncated_bytes: usize,
    pub presentation_time_micros: u64,
}

/// Produces complete media frames reassembled from an RTP stream.
///
/// At most one request may be outstanding at a time: callers must not call
/// [`FrameSource::request_frame`] again until the previous request's
/// `on_delivered` or `on_closed` has fired. Implementations enforce this
/// with a debug assertion — a double request is a caller bug, not a
/// runtime condition to recover from, the same contract-by-assertion style
/// the teacher applies to its packetizer's single-writer assumption.
pub trait FrameSource {
    /// Feed one RTP packet into the reassembly buffer. Returns `true` if a
    /// complete frame is now ready for the outstanding `request_frame`
    /// (if any) to pick up on the next reactor tick.
    fn on_rtp_packet(&mut self, packet: &[u8]) -> bool;

    /// Ask for the next complete frame. `buffer` is filled (truncated if
    /// the frame is larger than `buffer.len()`) and `on_delivered` is
    /// called once it is ready; `on_closed` fires instead if the source
    /// has permanently ended (e.g. RTCP BYE).
    fn request_frame(
        &mut self,
        buffer: &mut [u8],
        on_delivered: &mut dyn FnMut(FrameDelivered),
        on_closed: &mut dyn FnMut(),
    );

    /// True once the source has observed a permanent end (RTCP BYE or
    /// transport closure) and will never deliver another frame.
    fn is_closed(&self) -> bool;
}
