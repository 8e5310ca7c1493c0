use rollcall_core::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to merge config: {0}")]
    Merge(#[from] toml::ser::Error),
    #[error(transparent)]
    Invalid(#[from] rollcall_core::ConfigError),
}

/// CLI configuration: where templates live plus the session parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite template database.
    pub db_path: PathBuf,
    pub session: SessionConfig,
}

/// On-disk shape of `--config`. Keys left out keep the environment value.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    #[serde(default)]
    session: toml::Table,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("templates.db"));

        let d = SessionConfig::default();
        let session = SessionConfig {
            target_count: parse_or(&var, "ROLLCALL_TARGET_COUNT", d.target_count),
            min_captures: parse_or(&var, "ROLLCALL_MIN_CAPTURES", d.min_captures),
            descriptor_len: parse_or(&var, "ROLLCALL_DESCRIPTOR_LEN", d.descriptor_len),
            interval_ms: parse_or(&var, "ROLLCALL_INTERVAL_MS", d.interval_ms),
            per_attempt_timeout_ms: parse_or(&var, "ROLLCALL_ATTEMPT_TIMEOUT_MS", d.per_attempt_timeout_ms),
            total_session_timeout_ms: parse_or(&var, "ROLLCALL_SESSION_TIMEOUT_MS", d.total_session_timeout_ms),
            match_threshold: parse_or(&var, "ROLLCALL_MATCH_THRESHOLD", d.match_threshold),
            scan_frames: parse_or(&var, "ROLLCALL_SCAN_FRAMES", d.scan_frames),
            skip_dark_frames: var("ROLLCALL_SKIP_DARK_FRAMES")
                .map(|v| v != "0")
                .unwrap_or(d.skip_dark_frames),
            prompts: d.prompts,
        };

        Self { db_path, session }
    }

    /// Environment config, overlaid with `path` when given, then validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigFileError> {
        let mut config = Self::from_env();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            config.overlay(&text)?;
            tracing::debug!(path = %path.display(), "config file applied");
        }
        config.session.validate()?;
        Ok(config)
    }

    fn overlay(&mut self, text: &str) -> Result<(), ConfigFileError> {
        let file: ConfigFile = toml::from_str(text)?;
        if let Some(db_path) = file.db_path {
            self.db_path = db_path;
        }

        let mut merged = toml::Table::try_from(&self.session)?;
        merged.extend(file.session);
        self.session = SessionConfig::from_toml_str(&toml::to_string(&merged)?)?;
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}
