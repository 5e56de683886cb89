//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured level (or the CLI
//! override) applies. Chatty dependency crates are clamped to `warn`.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{prelude::*, registry, EnvFilter};

const QUIET_CRATES: &[&str] = &["tokio=warn", "hyper=warn", "hyper_util=warn", "reqwest=warn", "html5ever=warn"];

fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in QUIET_CRATES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber. `level` overrides the configured level.
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_subscriber(config: &LoggingConfig, level: Option<&str>) {
    let filter = build_filter(level.unwrap_or(&config.level));
    let subscriber = registry().with(filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let result = match config.format {
        LogFormat::Json => subscriber.with(fmt_layer.json()).try_init(),
        LogFormat::Human => subscriber.with(fmt_layer.with_target(false)).try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
