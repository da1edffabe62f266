//! RTSP-to-TCP media relay.
//!
//! Connects to an RTSP source as a client, negotiates a session, and
//! re-broadcasts each qualifying video subsession's reassembled elementary
//! frames to every plain-TCP client connected on a fixed listening port.
//! See `SPEC_FULL.md` in the repository root for the full module contract.

pub mod config;
pub mod error;
pub mod media;
pub mod reactor;
pub mod rtsp;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod transport;
pub mod url;
