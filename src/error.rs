//! Error types for the RTSP-to-TCP relay.

use std::fmt;

/// Errors that can surface out of the relay's top-level operations.
///
/// Per-subsession SETUP failures and downstream client faults are *not*
/// represented here — those are locally recovered (skip the subsession,
/// drop the connection) and only logged, per the error handling design.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad command-line invocation.
    #[error("usage error: {0}")]
    Usage(String),

    /// A non-2xx response to DESCRIBE, SETUP (all subsessions), or PLAY.
    #[error("RTSP error {status} on {method}: {detail}")]
    Rtsp {
        method: &'static str,
        status: u16,
        detail: String,
    },

    /// The DESCRIBE response body could not be parsed as SDP, or described
    /// a session with zero media subsessions.
    #[error("malformed SDP: {0}")]
    MalformedSdp(String),

    /// Failed to parse an RTSP request or response message.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// A 401/407 challenge could not be satisfied with the configured
    /// credentials (missing `-u`, or a second challenge after retrying once).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The RTSP URL given on the command line did not parse.
    #[error("invalid RTSP URL: {0}")]
    InvalidUrl(String),
}

/// Specific kind of RTSP message parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no status/request line).
    EmptyMessage,
    /// The status line didn't have the expected `RTSP/1.0 <code> <text>` shape.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a valid integer.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
