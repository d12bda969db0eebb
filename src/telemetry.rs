//! Tracing subscriber installation

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetrySettings;

/// Install the global subscriber. Returns false if one was already set.
pub fn init(settings: &TelemetrySettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    match installed {
        Ok(()) => {
            tracing::debug!(filter = %settings.filter, json = settings.json, "Telemetry initialized");
            true
        }
        Err(_) => false,
    }
}
