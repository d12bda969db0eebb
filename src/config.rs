//! Runtime settings
//!
//! Loaded from an optional TOML file, then overridden by `SYNDICATE__*`
//! environment variables (`SYNDICATE__SAGA__RETENTION_DAYS=7`).

use std::path::Path;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub delegation: DelegationSettings,
    pub saga: SagaSettings,
    pub events: EventSettings,
    pub sequencer: SequencerSettings,
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// File (if given) first, environment on top
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(Environment::with_prefix("SYNDICATE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationSettings {
    /// Upper bound on delegates a Manager runs at once
    pub max_concurrency: usize,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaSettings {
    /// Applied to steps without their own timeout
    pub default_step_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub retention_days: u32,
    pub resume_interval_secs: u64,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 30_000,
            retry_backoff_ms: 250,
            retention_days: 30,
            resume_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Unconfirmed entries older than this are replayed
    pub replay_window_minutes: u32,
    pub replay_interval_secs: u64,
    pub retention_days: u32,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            replay_window_minutes: 60,
            replay_interval_secs: 120,
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSettings {
    pub sweep_interval_secs: u64,
    /// Most enrollments executed per sweep
    pub batch_limit: usize,
    pub retry_delay_minutes: u32,
    /// Consecutive failed sends of one step before the enrollment is stopped
    pub max_send_attempts: u32,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            batch_limit: 100,
            retry_delay_minutes: 30,
            max_send_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}
