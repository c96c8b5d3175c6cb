//! Tracing subscriber setup for the binary
//!
//! Output goes to stderr so stdout stays clean for JSON results. The filter
//! comes from `ATTREX_LOG` (same syntax as `RUST_LOG`), defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "ATTREX_LOG";

/// Install the global subscriber. `verbose` forces `debug`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("attrex=debug,info")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
