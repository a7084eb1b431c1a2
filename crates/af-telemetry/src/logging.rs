use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Filter from `RUST_LOG`, or `default_directives` when unset or unparsable
/// (e.g. "info", "af_agents=debug,warn").
pub fn env_filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

/// Install the global subscriber. Returns `false` when one was already set,
/// which makes repeated calls from tests harmless.
pub fn init(service_name: &str, default_directives: &str, format: LogFormat) -> bool {
    let filter = env_filter(default_directives);
    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
    installed
}

/// Human-readable logging. Safe to call more than once.
pub fn init_logging(service_name: &str, default_directives: &str) {
    init(service_name, default_directives, LogFormat::Pretty);
}

/// JSON logging. Safe to call more than once.
pub fn init_logging_json(service_name: &str, default_directives: &str) {
    init(service_name, default_directives, LogFormat::Json);
}
