use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Initialize the global `tracing` subscriber. Verbosity is controlled with
/// the standard `RUST_LOG` environment variable (e.g. `RUST_LOG=injector=debug`);
/// defaults to `info` when unset.
pub fn init() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	fmt().with_env_filter(filter).with_target(true).init();
}
