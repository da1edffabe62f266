use std::process::ExitCode;

use rtsp_relay::config::Config;
use rtsp_relay::error::RelayError;
use rtsp_relay::reactor::Reactor;
use rtsp_relay::supervisor;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn run() -> Result<i32, RelayError> {
    let config = Config::from_args()?;
    init_logging(config.verbose);

    tracing::info!(url = %config.rtsp_url, port = config.tcp_server_port, "starting relay");

    let mut reactor = Reactor::new()?;
    let (supervisor, watch) = supervisor::bootstrap(&mut reactor, &config)?;

    reactor.run(&watch)?;

    Ok(supervisor.borrow().exit_code().unwrap_or(0))
}

/// Usage errors and RTSP/transport failures both exit 1; the distinction
/// is logged, not surfaced through the process exit code (§6).
fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(RelayError::Usage(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "relay exited with an error");
            ExitCode::from(1)
        }
    }
}
