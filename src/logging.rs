use std::str::FromStr;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::GateError;

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(GateError::Config(format!("unknown log format: {}", other))),
        }
    }
}

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,rate_gate=trace
pub fn init() {
    init_with(LogFormat::default());
}

/// Same as [`init`], choosing between human-readable and JSON lines output.
pub fn init_with(format: LogFormat) {
    INIT.call_once(|| {
        // Default to 'info' level if not specified
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true) // Useful for debugging concurrency issues
                        .with_line_number(true),
                )
                .init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_current_span(false))
                .init(),
        }

        tracing::info!(?format, "Logging initialized");
    });
}

/// Macro for logging admission decisions
#[macro_export]
macro_rules! admission_event {
    ($identity:expr, $key:expr, $verdict:expr, $cost:expr, $strategy:expr) => {
        tracing::info!(
            identity = $identity,
            key = $key,
            verdict = $verdict,
            cost = $cost,
            strategy = $strategy,
            "Admission check"
        )
    };
}

/// Macro for logging storage operations with timing
#[macro_export]
macro_rules! storage_op {
    ($operation:expr, $key:expr, $result:expr, $elapsed_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            key = $key,
            success = $result.is_ok(),
            elapsed_ms = $elapsed_ms,
            "Storage operation"
        )
    };
}
