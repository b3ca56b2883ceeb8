//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use flinger_media::{InstanceSettings, MSE_VIDEO_BUFFER_SIZE};

/// Configuration loading error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Most buffered ranges one append may report.
    pub max_buffered_ranges: usize,
    /// Seconds buffered ahead of the playhead for future data.
    pub future_data_threshold: f64,
    /// Seconds buffered ahead of the playhead for enough data.
    pub enough_data_threshold: f64,
    /// Accepted source buffer container types.
    pub supported_mime_types: Vec<String>,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Maximum number of instances in one session.
    pub max_instances_per_session: usize,
    /// Whether state snapshots are pushed to the host.
    pub notify_state_changes: bool,
}

impl EngineConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with a different buffered-range bound.
    pub fn strict_capacity(max_buffered_ranges: usize) -> Self {
        Self {
            max_buffered_ranges,
            ..Self::default()
        }
    }

    /// Read a JSON configuration file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffered_ranges == 0 {
            return Err(ConfigError::Invalid("max_buffered_ranges must be positive".into()));
        }
        if self.max_sessions == 0 || self.max_instances_per_session == 0 {
            return Err(ConfigError::Invalid("session limits must be positive".into()));
        }
        if !(self.future_data_threshold >= 0.0
            && self.enough_data_threshold >= self.future_data_threshold)
        {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy 0 <= future ({}) <= enough ({})",
                self.future_data_threshold, self.enough_data_threshold
            )));
        }
        Ok(())
    }

    /// Set session limits.
    pub fn with_limits(mut self, max_sessions: usize, max_instances_per_session: usize) -> Self {
        self.max_sessions = max_sessions;
        self.max_instances_per_session = max_instances_per_session;
        self
    }

    /// Set ready-state thresholds, in seconds.
    pub fn with_thresholds(mut self, future_data: f64, enough_data: f64) -> Self {
        self.future_data_threshold = future_data;
        self.enough_data_threshold = enough_data;
        self
    }

    /// Set accepted container types.
    pub fn with_mime_types<I, S>(mut self, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_mime_types = mime_types.into_iter().map(Into::into).collect();
        self
    }

    /// Set state-change notifications.
    pub fn with_state_notifications(mut self, enabled: bool) -> Self {
        self.notify_state_changes = enabled;
        self
    }

    /// Settings shared by every instance of the engine.
    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            max_buffered_ranges: self.max_buffered_ranges,
            future_data_threshold: self.future_data_threshold,
            enough_data_threshold: self.enough_data_threshold,
            supported_mime_types: self
                .supported_mime_types
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            notify_state_changes: self.notify_state_changes,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let instance = InstanceSettings::default();
        Self {
            max_buffered_ranges: MSE_VIDEO_BUFFER_SIZE,
            future_data_threshold: instance.future_data_threshold,
            enough_data_threshold: instance.enough_data_threshold,
            supported_mime_types: instance.supported_mime_types,
            max_sessions: 64,
            max_instances_per_session: 16,
            notify_state_changes: true,
        }
    }
}
