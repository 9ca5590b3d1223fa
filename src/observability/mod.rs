pub mod usage;

pub use usage::log_response_usage;

use tracing_subscriber::EnvFilter;

/// Map a config log level to a tracing filter directive.
///
/// - "DISABLED" -> `None`
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
#[must_use]
pub fn tracing_level(log_level: &str) -> Option<String> {
    let level = log_level.to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Install a global `fmt` subscriber at the configured log level.
///
/// `RUST_LOG`, when set, takes precedence. Returns `false` when logging is
/// disabled or a global subscriber is already installed.
pub fn init_tracing(log_level: &str) -> bool {
    let Some(level) = tracing_level(log_level) else {
        return false;
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(tracing_level("warning").as_deref(), Some("WARN"));
        assert_eq!(tracing_level("CRITICAL").as_deref(), Some("ERROR"));
        assert_eq!(tracing_level("debug").as_deref(), Some("DEBUG"));
        assert_eq!(tracing_level("DISABLED"), None);
    }

    #[test]
    fn test_disabled_installs_nothing() {
        assert!(!init_tracing("disabled"));
    }
}
