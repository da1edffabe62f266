//! RTSP client protocol implementation (RFC 2326).
//!
//! Mirrors the teacher crate's `protocol` module layout (request/response
//! types, method routing, SDP) but inverted: this side *sends* requests and
//! *parses* responses, and additionally owns the client state machine
//! (`engine`) and connection (`client`) that the teacher's server doesn't
//! need (a server reacts to one request at a time; a client drives a
//! multi-step handshake).
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability probe / keep-alive |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport per subsession |
//! | PLAY | §10.5 | Start media delivery |
//! | TEARDOWN | §10.7 | End the session |

pub mod auth;
pub mod client;
pub mod engine;
pub mod request;
pub mod response;
pub mod sdp;

pub use auth::Authenticator;
pub use engine::{Action, ClientEngine, State};
pub use request::RtspRequest;
pub use response::RtspResponse;
