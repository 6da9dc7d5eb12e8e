//! Diagnostic logging.
//!
//! Events go to stderr so they never mix with pipeline output on stdout.
//! The level comes from `RUST_LOG` and defaults to `warn`, e.g.
//! `RUST_LOG=pipesh=debug` shows every pipe, spawn and reap.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .without_time();

    // A subscriber may already be installed when embedded; keep the existing one.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
