use anyhow::{anyhow, Result};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Logging is initialized at most once per process
static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Parse a level name, falling back to `info`
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging system.
///
/// `RUST_LOG` directives are honoured on top of `log_level`.
pub fn init_logging(log_level: &str) -> Result<()> {
    if INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let mut result = Ok(());
    INIT.call_once(|| {
        let level = parse_level(log_level);
        let env_filter = EnvFilter::from_default_env().add_directive(level.into());

        let terminal_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_file(true)
            .with_line_number(true)
            .with_target(false);

        result = tracing_subscriber::registry()
            .with(env_filter)
            .with(terminal_layer)
            .try_init()
            .map_err(|e| anyhow!("Failed to set global tracing subscriber: {}", e));

        if result.is_ok() {
            tracing::debug!("Logging system initialized at {}", level);
        }
        INITIALIZED.store(true, Ordering::SeqCst);
    });

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging("debug").unwrap();
        init_logging("trace").unwrap();
    }
}
