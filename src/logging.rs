//! Structured logging init (A3): `tracing-subscriber` wired to `RUST_LOG`
//! with a config-supplied fallback level, plain text locally and JSON when
//! `LAKESYNC_LOG_FORMAT=json` is set.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber. `default_level` is the
/// `GatewayConfig::log_level` value, used only when `RUST_LOG` is unset.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let json = std::env::var("LAKESYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
