//! Session and matching parameters, with defaults and validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Poses the enrollee is walked through, one per capture slot.
pub const DEFAULT_PROMPTS: [&str; 5] = [
    "Look straight at the camera",
    "Turn your head slightly left",
    "Turn your head slightly right",
    "Tilt your head up slightly",
    "Smile naturally",
];

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("target_count ({target}) must be at least min_captures ({min})")]
    TargetBelowMinimum { target: usize, min: usize },
    #[error("min_captures must be at least 1")]
    ZeroMinCaptures,
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("invalid config file: {0}")]
    Parse(String),
}

/// Capture-session and matching parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Successful captures needed to finish an enrollment.
    pub target_count: usize,
    /// Fewest captures a template may ever be built from.
    pub min_captures: usize,
    /// Descriptor dimension produced by the face model.
    pub descriptor_len: usize,
    /// Time between capture attempts.
    pub interval_ms: u64,
    /// Upper bound on a single frame + detection attempt.
    pub per_attempt_timeout_ms: u64,
    /// Upper bound on a whole enrollment session.
    pub total_session_timeout_ms: u64,
    /// Maximum Euclidean distance for an accepted match. Model-dependent.
    pub match_threshold: f32,
    /// Frames examined by a class scan.
    pub scan_frames: usize,
    /// Skip frames that are almost entirely black before detection.
    pub skip_dark_frames: bool,
    pub prompts: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_count: 5,
            min_captures: 3,
            descriptor_len: 128,
            interval_ms: 1500,
            per_attempt_timeout_ms: 3000,
            total_session_timeout_ms: 30_000,
            match_threshold: 0.6,
            scan_frames: 3,
            skip_dark_frames: true,
            prompts: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_captures == 0 {
            return Err(ConfigError::ZeroMinCaptures);
        }
        if self.target_count < self.min_captures {
            return Err(ConfigError::TargetBelowMinimum {
                target: self.target_count,
                min: self.min_captures,
            });
        }
        if self.descriptor_len == 0 {
            return Err(ConfigError::NotPositive("descriptor_len"));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::NotPositive("interval_ms"));
        }
        if self.per_attempt_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("per_attempt_timeout_ms"));
        }
        if self.total_session_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("total_session_timeout_ms"));
        }
        // Also rejects NaN.
        if !(self.match_threshold > 0.0) {
            return Err(ConfigError::NotPositive("match_threshold"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn total_session_timeout(&self) -> Duration {
        Duration::from_millis(self.total_session_timeout_ms)
    }

    /// Prompt for the given capture slot, cycling when slots outnumber prompts.
    pub fn prompt_for(&self, slot: usize) -> Option<&str> {
        if self.prompts.is_empty() {
            return None;
        }
        Some(self.prompts[slot % self.prompts.len()].as_str())
    }
}
