//! Logging configuration using the tracing framework
//!
//! Logs can be controlled via the RUST_LOG environment variable. Without it
//! the crate logs at info level, or debug with `--verbose`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("taxcert=debug,warn")
        } else {
            EnvFilter::new("taxcert=info,warn")
        }
    })
}

/// Initialize the logging system
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log level (e.g., "debug", "info", "warn", "error")
///   - Default: "taxcert=info"
///   - Examples:
///     - `RUST_LOG=taxcert=trace` - Trace logs for this crate only
///     - `RUST_LOG=taxcert::pricing=debug` - Every line item and its rule
pub fn init(verbose: bool) {
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_line_number(verbose)
                .with_file(false),
        )
        .init();
}

/// Initialize logging to stderr and to a daily rotated file in the
/// application's data directory (`<data dir>/logs/<log_file_name>`).
pub fn init_with_file(log_file_name: &str, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let log_dir = if let Some(proj_dirs) = directories::ProjectDirs::from("be", "scouting", "taxcert") {
        let log_path = proj_dirs.data_dir().join("logs");
        std::fs::create_dir_all(&log_path)?;
        log_path
    } else {
        std::env::current_dir()?
    };

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_file_name);

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .init();

    Ok(())
}

/// Initialize logging for tests
///
/// Only errors are shown unless RUST_LOG says otherwise.
#[cfg(test)]
pub fn init_test() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init()
        .ok(); // Ignore errors if already initialized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init_test();
        init_test();
    }

    #[test]
    fn test_structured_logging() {
        init_test();

        tracing::info!(member = "Lotte Peeters", serial = 2024001, "Certificate written");
        tracing::warn!("Skipping {}: no eligible activities", "Jan De Smet");
    }
}
