use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "warn,gemini_webapi=debug,gemini=debug"
    } else {
        "warn"
    }
}

/// Logs go to stderr so replies on stdout stay clean.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(default_filter(true))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(false).into())
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
