//! Tracing subscriber setup shared by the daemon binaries.

use tracing_subscriber::EnvFilter;

/// Structured JSON logging for production daemons, filtered by `RUST_LOG`.
pub fn init_json_logger() {
	tracing_subscriber::FmtSubscriber::builder()
		.json()
		.with_env_filter(EnvFilter::from_default_env())
		.init();
}

/// Compact human-readable logging for tests. Safe to call repeatedly.
pub fn init_test_logger() {
	let _result = tracing_subscriber::FmtSubscriber::builder()
		.compact()
		.with_env_filter(EnvFilter::from_default_env())
		.try_init();
}
