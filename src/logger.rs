use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Install the global subscriber. `RUST_LOG` wins over the
// build default (trace for debug builds, info for release).
pub fn init_logging() {
    let default_level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let filter = env_filter.unwrap_or_else(|| EnvFilter::new(default_level));

    // No module paths in the output
    let fmt_layer = fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();

    if !from_env {
        info!("\"RUST_LOG\" variable not set, defaulting to {default_level}");
    }
}
