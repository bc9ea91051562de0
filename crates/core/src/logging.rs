use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

const DEFAULT_FILTER: &str = "info";

/// Accepts the common level aliases on top of `EnvFilter` directives.
fn normalize_level(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "fatal" | "critical" => "error".to_string(),
        _ => raw.trim().to_string(),
    }
}

fn build_env_filter_from(log_level: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new(DEFAULT_FILTER);

    if let Some(v) = log_level.filter(|v| !v.trim().is_empty()) {
        return EnvFilter::try_new(normalize_level(v)).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log.filter(|v| !v.trim().is_empty()) {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

/// Installs the global subscriber once; later calls are no-ops.
///
/// `LOG_LEVEL` wins over `RUST_LOG`, which wins over `info`.
pub fn init_logging(log_level: Option<&str>, format: LogFormat) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter_from(log_level, std::env::var("RUST_LOG").ok().as_deref());
        let registry = tracing_subscriber::registry().with(env_filter);

        let _ = match format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_log_level_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("debug"), Some("trace"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);
        let f4 = build_env_filter_from(Some("  "), Some("error"));

        assert_eq!(f1.to_string(), "debug");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "info");
        assert_eq!(f4.to_string(), "error");
    }

    #[test]
    fn level_aliases_are_normalized() {
        assert_eq!(build_env_filter_from(Some("WARNING"), None).to_string(), "warn");
        assert_eq!(build_env_filter_from(Some("fatal"), None).to_string(), "error");
        assert_eq!(
            build_env_filter_from(Some("teledrive_core=debug"), None).to_string(),
            "teledrive_core=debug"
        );
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(Some("info"), LogFormat::Json);
        init_logging(Some("debug"), LogFormat::Text);
        tracing::info!(event = "logging.test", "logging.test");
    }
}
