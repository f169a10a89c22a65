//! Structured logging setup for the `harvest` binary.
//!
//! Pipeline modules log through `tracing` macros with structured fields.
//! The binary installs one `fmt` layer writing to stderr so stdout stays
//! reserved for command output.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Default filter directive: `info`, or `debug` with `--verbose`.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "build_harvest=debug,harvest=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
///
/// Safe to call more than once; only the first call has effect.
pub fn init_logging(verbose: bool) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init();
    });
}
