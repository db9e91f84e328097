//! # Tracing Module
//!
//! Environment-aware console logging using the tracing ecosystem. Workers run in
//! containers, so everything goes to stdout: JSON lines in production or when
//! stdout is not a terminal, coloured human output otherwise.
//!
//! Level selection:
//! - `RUST_LOG` wins when set (full `EnvFilter` syntax)
//! - otherwise `LOG_LEVEL` (`DEBUG`, `WARN`, `ERROR`; anything else means `INFO`)

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console logging from the process environment
pub fn init_tracing() {
    let environment = std::env::var("ENV").unwrap_or_else(|_| "dev".to_string());
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_default();
    init_tracing_with(&environment, &log_level);
}

/// Initialize console logging for an explicit environment and level
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing_with(environment: &str, log_level: &str) {
    TRACING_INITIALIZED.get_or_init(|| {
        let level = level_directive(log_level);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let json = use_json_output(environment, std::io::stdout().is_terminal());

        let layer = if json {
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_target(true)
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A subscriber installed by an embedding host takes precedence
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            environment = %environment,
            level = %level,
            json_output = json,
            "Tracing initialized"
        );
    });
}

/// Map the `LOG_LEVEL` convention onto a tracing level directive
fn level_directive(log_level: &str) -> &'static str {
    match log_level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

fn use_json_output(environment: &str, stdout_is_terminal: bool) -> bool {
    matches!(environment, "prod" | "production") || !stdout_is_terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("warn"), "warn");
        assert_eq!(level_directive("ERROR"), "error");
        assert_eq!(level_directive(""), "info");
        assert_eq!(level_directive("TRACE"), "info");
    }

    #[test]
    fn test_json_output_selection() {
        assert!(use_json_output("production", true));
        assert!(use_json_output("dev", false));
        assert!(!use_json_output("dev", true));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing_with("test", "debug");
        init_tracing_with("test", "error");
    }
}
