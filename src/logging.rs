use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured default so operators can raise verbosity without touching the
/// settings file.
pub fn init(default_directives: &str) {
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new(default_directives)),
		)
		.try_init()
		.expect("setting default subscriber failed");
}
