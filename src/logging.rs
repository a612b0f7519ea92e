//! Tracing subscriber setup for binaries and tests embedding the engine.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs a stdout subscriber at the given level. `SHADOWLEASE_LOG`
/// overrides the level per module when set.
pub fn init_stdout(max_level: Level) {
    let filter = EnvFilter::try_from_env("SHADOWLEASE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(max_level.to_string()));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(true)
                .with_thread_names(true)
                .with_filter(filter),
        )
        .init();
}

/// Best-effort subscriber for tests; repeated calls are harmless.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_test_writer()
                .with_filter(EnvFilter::new("debug")),
        )
        .try_init();
}
