use cloudstash::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{DaemonError, Result};

/// Installs the global subscriber and routes `log` records into it.
///
/// `RUST_LOG` wins over the configured level; `verbose` wins over both.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let (json_layer, text_layer) = if config.json {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(fmt::layer().with_target(false)))
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    tracing_log::LogTracer::init().map_err(|e| DaemonError::Logging(e.to_string()))?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| DaemonError::Logging(e.to_string()))?;

    Ok(())
}
