//! Tracing bootstrap

use std::sync::Once;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::SyncConfig;

/// Initialize tracing with stdout and daily-rotated file output
///
/// `RUST_LOG` wins over the configured level. Safe to call more than once;
/// only the first call installs the subscriber.
pub fn init_tracing(config: &SyncConfig) -> anyhow::Result<()> {
	static INIT: Once = Once::new();
	let mut result = Ok(());

	INIT.call_once(|| {
		// Ensure logs directory exists
		let logs_dir = config.logs_dir();
		if let Err(e) = std::fs::create_dir_all(&logs_dir) {
			result = Err(anyhow::anyhow!("Failed to create logs directory: {}", e));
			return;
		}

		let fallback = format!(
			"quire_core={level},quire_server={level}",
			level = config.log_level
		);

		let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "quire.log");

		if let Err(e) = tracing_subscriber::registry()
			.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_writer(std::io::stdout),
			)
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_ansi(false) // No ANSI colors in log files
					.with_writer(file_appender),
			)
			.try_init()
		{
			result = Err(anyhow::anyhow!("Failed to initialize tracing: {}", e));
		}
	});

	result
}
