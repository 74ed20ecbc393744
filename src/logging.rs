// Logging setup for the runner binary. The library itself only emits `tracing`
// events; installing a subscriber is left to whoever owns `main`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a stderr subscriber, leaving stdout to the runner's report. `RUST_LOG` takes precedence over `log_level`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(log_level: &str, json_format: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    let result = if json_format {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::info!(level = log_level, json = json_format, "logging initialized");
    }
    result.is_ok()
}
