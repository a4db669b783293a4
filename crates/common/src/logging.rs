//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log levels accepted by [`setup_logging`] and the config files
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Build the filter: `RUST_LOG` wins, otherwise `default_level`
pub fn log_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// Transfer completions run on the event pump thread, so thread names are
/// part of every line.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = log_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_accepts_levels() {
        for level in LOG_LEVELS {
            assert!(log_filter(level).is_ok(), "level {} rejected", level);
        }
    }

    #[test]
    fn test_log_filter_accepts_directives() {
        assert!(log_filter("host=debug,usbproto=warn").is_ok());
    }
}
