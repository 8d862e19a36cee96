use tracing::info;
use tracing_subscriber::{
	fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
	/// Filter directive, e.g. `info` or `auction_scanner=debug,info`.
	/// `RUST_LOG` takes precedence when set.
	pub level: String,
	pub json_format: bool,
	pub with_thread_ids: bool,
	pub with_file_and_line: bool,
	pub with_target: bool,
	pub with_span_events: FmtSpan,
}

impl Default for TracingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			json_format: false,
			with_thread_ids: false,
			with_file_and_line: false,
			with_target: true,
			with_span_events: FmtSpan::NONE,
		}
	}
}

impl TracingConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_level(mut self, level: impl Into<String>) -> Self {
		self.level = level.into();
		self
	}

	pub fn with_json_format(mut self, json: bool) -> Self {
		self.json_format = json;
		self
	}

	pub fn debug() -> Self {
		Self {
			with_file_and_line: true,
			with_span_events: FmtSpan::CLOSE,
			..Self::default().with_level("debug")
		}
	}

	pub fn production() -> Self {
		Self {
			with_thread_ids: true,
			with_target: false,
			..Self::default().with_json_format(true)
		}
	}

	fn filter(&self) -> Result<EnvFilter, String> {
		match EnvFilter::try_from_default_env() {
			Ok(filter) => Ok(filter),
			Err(_) => EnvFilter::try_new(&self.level)
				.map_err(|e| format!("Invalid log level '{}': {}", self.level, e)),
		}
	}
}

/// Initialize tracing with the given configuration
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error>> {
	let subscriber = tracing_subscriber::registry().with(config.filter()?);

	if config.json_format {
		let json_layer = tracing_subscriber::fmt::layer()
			.json()
			.with_span_events(config.with_span_events.clone())
			.with_thread_ids(config.with_thread_ids)
			.with_file(config.with_file_and_line)
			.with_line_number(config.with_file_and_line)
			.with_target(config.with_target);

		subscriber
			.with(json_layer)
			.try_init()
			.map_err(|e| format!("Failed to initialize tracing: {}", e))?;
	} else {
		let fmt_layer = tracing_subscriber::fmt::layer()
			.with_span_events(config.with_span_events.clone())
			.with_thread_ids(config.with_thread_ids)
			.with_file(config.with_file_and_line)
			.with_line_number(config.with_file_and_line)
			.with_target(config.with_target);

		subscriber
			.with(fmt_layer)
			.try_init()
			.map_err(|e| format!("Failed to initialize tracing: {}", e))?;
	}

	info!(level = %config.level, json = config.json_format, "tracing initialized");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_presets() {
		let debug = TracingConfig::debug();
		assert_eq!(debug.level, "debug");
		assert!(debug.with_file_and_line);
		assert!(TracingConfig::production().json_format);
		if std::env::var("RUST_LOG").is_err() {
			assert!(TracingConfig::new().with_level("auction_core=debug,info").filter().is_ok());
		}
	}
}
