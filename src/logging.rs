//! Logging prelude module for convenient access to tracing macros.

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at INFO level and above are displayed. Control the
/// log level with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug meshsync scan
/// RUST_LOG=meshsync::model=trace meshsync scan
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
