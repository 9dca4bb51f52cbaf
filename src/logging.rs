//! Logging prelude module for convenient access to tracing macros.
//!
//! Re-exports the common tracing macros and provides the subscriber
//! initialization used by the `rsup` binary.  The csup verbosity levels
//! map onto tracing levels: server/protocol failures are `error!`, the
//! per-file progress lines are `info!` and the session plumbing is
//! `debug!`.

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at INFO level and above are displayed.  Control the
/// log level with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug rsup supfile.toml
/// RUST_LOG=rsup::updater=trace rsup supfile.toml
/// ```
pub fn init_tracing() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();
}

/// Initialize with an explicit default level (the `-L` command line knob).
/// `RUST_LOG` still takes precedence when set.
pub fn init_tracing_level(level: &str) {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
		)
		.with_writer(std::io::stderr)
		.init();
}

// vim: ts=4
