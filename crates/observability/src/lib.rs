//! Tracing/logging setup shared by the engine's binaries.

use serde::Deserialize;

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Output format of the process log.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event (the default for deployed workers).
    #[default]
    Json,
    /// Human-readable multi-line output for local runs.
    Pretty,
}

/// Logging section of the worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: "info".to_string(),
        }
    }
}

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LoggingConfig) {
    tracing::init(config.format, &config.default_filter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_section_defaults_to_json_info() {
        let cfg: LoggingConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.default_filter, "info");
    }

    #[test]
    fn parses_pretty_format() {
        let cfg: LoggingConfig = toml::from_str("format = \"pretty\"\ndefault_filter = \"innsync=debug\"").unwrap();
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert_eq!(cfg.default_filter, "innsync=debug");
    }

    #[test]
    fn init_twice_is_harmless() {
        let cfg = LoggingConfig::default();
        init(&cfg);
        init(&cfg);
    }
}
