//! Logging configuration using tracing
//!
//! Structured logging to stderr with RUST_LOG-based filtering. Migration
//! progress (issue found, attachment uploaded, comment created) is reported
//! at info level; transport retries and skipped items at warn/debug.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// Filtering via the RUST_LOG environment variable, defaulting to "info" so
/// a migration run narrates what it creates without extra flags.
///
/// # Example RUST_LOG values
/// - `RUST_LOG=debug` - Show debug and above
/// - `RUST_LOG=bzjira=trace` - Trace level for the bzjira crate
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init() -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::BzJiraError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_helper() {
        // Should never panic
        init_test();
        init_test(); // Can be called multiple times
    }

    #[test]
    fn test_logging_macros() {
        init_test();

        tracing::debug!("This is a debug message");
        tracing::info!(source_id = "42", "Testing structured logging");
    }
}
