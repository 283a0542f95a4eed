//! Observability utilities.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::config::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// The configured log level is the filter fallback; `RUST_LOG` overrides it.
/// JSON formatting comes from the config and can be forced on via
/// `GATE_LOG_FORMAT=json`.
pub fn init_tracing(config: &ObservabilityConfig) {
    let level = config.log_level.clone();
    let json_logs = config.json_logs;
    TRACING_INIT.get_or_init(move || {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let json = std::env::var("GATE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(json_logs);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}
