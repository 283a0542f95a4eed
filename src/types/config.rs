//! Configuration structures.
//!
//! Static tunables loaded from config files or environment. Collaborator
//! objects (storage, process factory, authorizer, sources) are wired through
//! [`crate::server::ServerBuilder`] instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Default resource limits, applied before the authorizer adjusts them.
    #[serde(default)]
    pub limits: DefaultLimits,

    /// Shutdown coordination.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Default resource limits. The authorizer may lower (or raise) these per
/// principal on every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimits {
    /// Maximum WebAssembly module size in bytes.
    pub max_module_size: usize,

    /// Maximum native program code size in bytes.
    pub max_text_size: usize,

    /// Maximum suspended stack size in bytes.
    pub max_stack_size: usize,

    /// Linear memory growth limit in bytes.
    pub max_memory_size: usize,

    /// Maximum number of breakpoints per instance.
    pub max_breakpoints: usize,

    /// Granularity of the time functions exposed to instances.
    #[serde(with = "humantime_serde")]
    pub time_resolution: Duration,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            max_module_size: 32 * 1024 * 1024,
            max_text_size: 16 * 1024 * 1024,
            max_stack_size: 64 * 1024,
            max_memory_size: 32 * 1024 * 1024,
            max_breakpoints: 100,
            time_resolution: Duration::from_millis(10),
        }
    }
}

/// Shutdown coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for suspending instances to drain before giving up.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.limits.max_module_size, 32 * 1024 * 1024);
        assert_eq!(config.limits.max_breakpoints, 100);
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(r#"{"limits": {"max_module_size": 1024, "max_text_size": 512, "max_stack_size": 64, "max_memory_size": 2048, "max_breakpoints": 4, "time_resolution": "1s"}}"#).unwrap();
        assert_eq!(config.limits.max_module_size, 1024);
        assert_eq!(config.limits.time_resolution, Duration::from_secs(1));
        assert_eq!(config.observability.log_level, "info");
    }
}
