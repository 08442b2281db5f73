// Logging setup for the taskpool binary
//
// Console output only: a `fmt` layer filtered by `RUST_LOG` / `LOG_LEVEL`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info";

/// Configuration for log output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, attached to the startup log line
    pub service_name: String,

    /// Log filter (e.g., "info", "debug", "taskpool_engine=debug")
    pub log_filter: Option<String>,

    /// Whether to colorize console output
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "taskpool".to_string(),
            log_filter: None,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "taskpool")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter (default: "info")
    /// - `NO_COLOR`: Disable colored output when set
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "taskpool".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ansi: std::env::var_os("NO_COLOR").is_none(),
        }
    }

    /// Build the filter, falling back to `info` when unset or unparsable
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global tracing subscriber
///
/// Call once, before anything logs.
pub fn init_telemetry(config: TelemetryConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(config.ansi)
        .with_filter(config.env_filter());

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(service = %config.service_name, "Telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_is_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.env_filter().to_string(), "info");
    }

    #[test]
    fn test_custom_filter() {
        let config = TelemetryConfig {
            log_filter: Some("taskpool_engine=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(config.env_filter().to_string(), "taskpool_engine=debug");
    }
}
