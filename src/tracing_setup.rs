//! Logging for the `agent-bus` binary and for embedders that want the same
//! output.
//!
//! Bus events are logged with structured fields (`message_id`, `source`,
//! `target`, `subscriber`), so the JSON format is the one to ship to a log
//! collector; the pretty format is for watching a demo run in a terminal.
//!
//! ```rust,ignore
//! use agent_bus::tracing_setup::{log_format, setup_logging};
//!
//! setup_logging(log_format(false), "info");
//! ```

use crate::settings::LogFormat;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Set to `1` or `true` to force JSON output.
pub const LOG_JSON_ENV: &str = "AGENT_BUS_LOG_JSON";

/// Names a format (`json` or `pretty`); read when [`LOG_JSON_ENV`] is unset.
pub const LOG_FORMAT_ENV: &str = "AGENT_BUS_LOG_FORMAT";

/// Pick the output format: an explicit request wins, then
/// `AGENT_BUS_LOG_JSON`, then `AGENT_BUS_LOG_FORMAT`, then pretty.
pub fn log_format(force_json: bool) -> LogFormat {
    if force_json || should_use_json() {
        return LogFormat::Json;
    }
    std::env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|v| LogFormat::from_str(&v))
        .unwrap_or_default()
}

/// Check if JSON logging is forced via [`LOG_JSON_ENV`].
pub fn should_use_json() -> bool {
    std::env::var(LOG_JSON_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `default_level` (e.g. `agent_bus::bus=trace`). An
/// unparsable level falls back to `info`. A second call keeps the first
/// subscriber.
pub fn setup_logging(format: LogFormat, default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(true).with_file(false))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both variables are process-global, so one test walks every case.
    #[test]
    fn test_log_format_precedence() {
        std::env::remove_var(LOG_JSON_ENV);
        std::env::remove_var(LOG_FORMAT_ENV);
        assert_eq!(log_format(false), LogFormat::Pretty);
        assert_eq!(log_format(true), LogFormat::Json);

        std::env::set_var(LOG_FORMAT_ENV, "json");
        assert_eq!(log_format(false), LogFormat::Json);

        std::env::set_var(LOG_FORMAT_ENV, "xml");
        assert_eq!(log_format(false), LogFormat::Pretty);

        std::env::set_var(LOG_JSON_ENV, "TRUE");
        assert!(should_use_json());
        assert_eq!(log_format(false), LogFormat::Json);

        std::env::set_var(LOG_JSON_ENV, "no");
        assert!(!should_use_json());

        std::env::remove_var(LOG_JSON_ENV);
        std::env::remove_var(LOG_FORMAT_ENV);
    }

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        setup_logging(LogFormat::Pretty, "not-a-level");
        setup_logging(LogFormat::Json, "warn");
    }
}
