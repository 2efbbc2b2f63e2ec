//! Structured logging for Tessera.
//!
//! Logs go through the `tracing` facade and are filtered by the `TESSERA_LOG`
//! environment variable.
//!
//! # Environment Variables
//!
//! - `TESSERA_LOG=info` - Default log level (info)
//! - `TESSERA_LOG=debug` - Split timings and per-partition dispatch events
//! - `TESSERA_LOG=tessera_executor::dispatcher=trace` - Module-specific logging
//!
//! # Example
//!
//! ```ignore
//! use tessera_storage::logging;
//!
//! logging::init();
//! ```

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_ENV: &str = "TESSERA_LOG";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initializes the global tracing subscriber at `info`.
///
/// Subsequent calls are ignored (tracing only allows one subscriber).
pub fn init() {
    init_with_default("info");
}

/// Initializes the global tracing subscriber with a custom default level,
/// used when `TESSERA_LOG` is not set.
pub fn init_with_default(default_level: &str) {
    let subscriber = fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = subscriber.try_init();
}

/// Initializes logging with JSON output format.
pub fn init_json() {
    let subscriber = fmt()
        .with_env_filter(filter("info"))
        .with_target(true)
        .json();

    let _ = subscriber.try_init();
}

/// Initializes logging from the `[logging]` configuration section.
pub fn init_from_config(config: &LoggingConfig) {
    if config.json {
        let subscriber = fmt()
            .with_env_filter(filter(&config.level))
            .with_target(true)
            .json();
        let _ = subscriber.try_init();
    } else {
        init_with_default(&config.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init();
        init();
        init_with_default("warn");
        init_from_config(&LoggingConfig::default());
    }
}
