//! Command-line surface.
//!
//! Mirrors `crates/cli`'s `clap::Parser` derive, but with the flag set
//! the relay actually needs (§6).

use clap::Parser;

use crate::error::{RelayError, Result};

/// RTSP-to-TCP media relay.
///
/// Connects to an RTSP source, negotiates a session, and re-broadcasts
/// each video subsession's elementary frames to every TCP client
/// connected on the listening port, one frame per segment.
#[derive(Parser, Debug)]
#[command(name = "rtsp-relay", version, about)]
struct Args {
    /// Tunnel RTP/RTCP over the RTSP control connection instead of
    /// separate UDP ports.
    #[arg(short = 't')]
    tunnel_over_tcp: bool,

    /// Username and password for Basic/Digest authentication.
    #[arg(short = 'u', num_args = 2, value_names = ["USER", "PASS"])]
    credentials: Option<Vec<String>>,

    /// `User-Agent` header sent with every outbound RTSP request.
    #[arg(short = 'g', value_name = "UA")]
    user_agent: Option<String>,

    /// Listening TCP port for the fan-out sink. 0 picks an ephemeral port.
    #[arg(short = 'p', default_value_t = 9001, value_name = "PORT")]
    tcp_server_port: u16,

    /// Send periodic keep-alive OPTIONS requests (workaround for RTSP
    /// servers that otherwise drop the session after its timeout).
    #[arg(short = 'K')]
    keep_alive: bool,

    /// Raise logging verbosity to `debug`.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// `rtsp://` URL of the source to relay.
    rtsp_url: String,
}

/// Validated configuration for one relay run.
#[derive(Debug, Clone)]
pub struct Config {
    pub tunnel_over_tcp: bool,
    pub credentials: Option<(String, String)>,
    pub user_agent: String,
    pub tcp_server_port: u16,
    pub keep_alive: bool,
    pub verbose: bool,
    pub rtsp_url: String,
}

impl Config {
    pub fn from_args() -> Result<Self> {
        let args = Args::try_parse().map_err(|e| RelayError::Usage(e.to_string()))?;

        let credentials = match args.credentials {
            Some(pair) => {
                let mut it = pair.into_iter();
                let user = it.next().expect("num_args = 2");
                let pass = it.next().expect("num_args = 2");
                Some((user, pass))
            }
            None => None,
        };

        Ok(Config {
            tunnel_over_tcp: args.tunnel_over_tcp,
            credentials,
            user_agent: args.user_agent.unwrap_or_else(|| {
                format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
            }),
            tcp_server_port: args.tcp_server_port,
            keep_alive: args.keep_alive,
            verbose: args.verbose,
            rtsp_url: args.rtsp_url,
        })
    }
}
