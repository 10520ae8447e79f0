//! Tracing subscriber initialization.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the global tracing subscriber. Log level comes from
/// `RUST_LOG` (default info); `LOG_FORMAT=json` switches to structured
/// JSON output for log aggregation.
pub fn init_telemetry() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
