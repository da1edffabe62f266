//! Wire transports for inbound media: UDP (default) and TCP-interleaved
//! (`-t`). Both ultimately hand raw RTP packet bytes to a subsession's
//! `media::FrameSource`.

pub mod interleaved;
pub mod udp;
