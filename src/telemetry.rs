//! Log subscriber setup
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::settings::LogFormat;

/// Installs the process subscriber. `RUST_LOG` takes precedence over `log_level`.
///
/// Components do not log through a global of their own; each one is handed a
/// [tracing::Span] at construction and emits its events under it.
pub fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Pretty => builder.try_init(),
    }
    .map_err(|e| anyhow!("installing log subscriber: {e}"))
}
