//! Log output setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LogSettings;
use crate::error::{Result, SyncError};

/// Builds the filter: `RUST_LOG` when set, the configured directives otherwise.
pub fn env_filter(settings: &LogSettings) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.filter)
            .map_err(|e| SyncError::Telemetry(format!("invalid filter '{}': {}", settings.filter, e))),
    }
}

/// Installs the global subscriber and routes `log` records into it.
///
/// Fails when a global subscriber or logger is already set.
pub fn init_tracing(settings: &LogSettings) -> Result<()> {
    let filter = env_filter(settings)?;
    let registry = Registry::default().with(filter);

    let installed = if settings.json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        )
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
    };
    installed.map_err(|e| SyncError::Telemetry(e.to_string()))?;

    tracing_log::LogTracer::init().map_err(|e| SyncError::Telemetry(e.to_string()))
}
