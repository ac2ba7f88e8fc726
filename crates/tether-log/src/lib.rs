//! Structured logging for tether applications.
//!
//! Provides span-based, filterable logging via the `tracing` ecosystem:
//! console output with module paths and an uptime timer, filtered by
//! `RUST_LOG` or a configured level string.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// The filter is taken from the `RUST_LOG` environment variable when set,
/// otherwise from `level_override` (e.g. a configured log level), otherwise
/// it defaults to `info`.
///
/// # Examples
///
/// ```no_run
/// // Basic initialization
/// tether_log::init_logging(None);
///
/// // With a configured level
/// tether_log::init_logging(Some("debug,tether_net=trace"));
/// ```
pub fn init_logging(level_override: Option<&str>) {
    let fallback = level_override.filter(|s| !s.is_empty()).unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true) // I/O workers are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}
