//! Log output for processes hosting a push endpoint.
//!
//! The library only emits `tracing` events. [`init_logging_from_env`]
//! installs a subscriber driven by:
//!
//! - `PUSH_LOG_MODE`: `compact` (default), `json` or `silent`
//! - `PUSH_LOG_LEVEL`: filter directive such as `debug` or
//!   `push_subscriber=trace`, falling back to `RUST_LOG`, then `info`

use tracing_subscriber::EnvFilter;

const MODE_VAR: &str = "PUSH_LOG_MODE";
const LEVEL_VAR: &str = "PUSH_LOG_LEVEL";

/// Shape of the log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Nothing is installed
    Silent,
    /// One human readable line per event
    #[default]
    Compact,
    /// One JSON object per event, for log collectors
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("silent") => Self::Silent,
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to install tracing subscriber: {0}")]
pub struct LoggingError(String);

/// Install the global subscriber for `format`.
pub fn init_logging(format: LogFormat) -> Result<(), LoggingError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(|name| std::env::var(name).ok()));

    let installed = match format {
        LogFormat::Silent => return Ok(()),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    installed.map_err(|err| LoggingError(err.to_string()))
}

/// Install the global subscriber described by `PUSH_LOG_MODE`.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_logging(LogFormat::from_env_value(std::env::var(MODE_VAR).ok().as_deref()))
}

fn env_filter(lookup: impl Fn(&str) -> Option<String>) -> EnvFilter {
    let directives = lookup(LEVEL_VAR)
        .or_else(|| lookup("RUST_LOG"))
        .unwrap_or_else(|| "info".to_string());
    EnvFilter::new(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_env_value() {
        assert_eq!(LogFormat::from_env_value(Some("silent")), LogFormat::Silent);
        assert_eq!(LogFormat::from_env_value(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some("compact")), LogFormat::Compact);
        assert_eq!(LogFormat::from_env_value(Some("verbose")), LogFormat::Compact);
        assert_eq!(LogFormat::from_env_value(None), LogFormat::default());
    }

    #[test]
    fn test_level_lookup_order() {
        let both = |name: &str| match name {
            "PUSH_LOG_LEVEL" => Some("push_subscriber=trace".to_string()),
            "RUST_LOG" => Some("warn".to_string()),
            _ => None,
        };
        assert_eq!(env_filter(both).to_string(), "push_subscriber=trace");

        let rust_log = |name: &str| (name == "RUST_LOG").then(|| "warn".to_string());
        assert_eq!(env_filter(rust_log).to_string(), "warn");

        assert_eq!(env_filter(|_: &str| None).to_string(), "info");
    }

    #[test]
    fn test_silent_installs_nothing() {
        assert!(init_logging(LogFormat::Silent).is_ok());
    }
}
