// Tracing subscriber setup for embedding applications

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Default filter directive for a verbosity level (`-v` count)
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "conductor=warn",
        1 => "conductor=info",
        2 => "conductor=debug",
        _ => "conductor=trace",
    }
}

/// Install a global fmt subscriber.
///
/// `RUST_LOG` overrides the verbosity default. Returns false if a global
/// subscriber was already installed, which leaves the existing one alone.
pub fn init_tracing(verbosity: u8) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .with_span_events(if verbosity >= 3 {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
