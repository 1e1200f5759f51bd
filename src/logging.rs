//! Tracing setup. Diagnostics go to stderr so piped stdout stays clean;
//! verbosity is controlled through `MODS_LOG` (EnvFilter syntax).

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter =
        EnvFilter::try_from_env("MODS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
