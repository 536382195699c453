use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Process-level settings. Persona behavior lives in the database and is
/// re-read by the loops every cycle, so this stays small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Directory holding uploaded image content referenced by `image_path`.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Cadence of the pool maintenance loop (expiry sweep + ephemeral purge).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Poll cadence while a persona's surface is disconnected or idle.
    #[serde(default = "default_recovery_poll_secs")]
    pub recovery_poll_secs: u64,
}

fn default_database_path() -> String {
    "chorus.db".to_string()
}

fn default_upload_dir() -> String {
    "data/uploads".to_string()
}

fn default_maintenance_interval_secs() -> u64 {
    600
}

fn default_recovery_poll_secs() -> u64 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            upload_dir: default_upload_dir(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            recovery_poll_secs: default_recovery_poll_secs(),
        }
    }
}

impl ServiceConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("chorus_config.toml")
    }

    /// Load config from chorus_config.toml, falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<ServiceConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable). Used by the operator
    /// layer to persist settings edits.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("CHORUS_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(dir) = env::var("CHORUS_UPLOAD_DIR") {
            if !dir.trim().is_empty() {
                config.upload_dir = dir;
            }
        }

        if let Ok(interval) = env::var("CHORUS_MAINTENANCE_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.maintenance_interval_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("CHORUS_RECOVERY_POLL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.recovery_poll_secs = seconds;
            }
        }

        config
    }
}
