use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RecordsError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Role that receives submitted field reports.
    #[serde(default = "default_reviewer_role")]
    pub reviewer_role: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Path prefix for uploaded report artifacts.
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,
    #[serde(default = "default_true")]
    pub verify_after_delete: bool,
    #[serde(default = "default_week_days")]
    pub week_days: i64,
}

fn default_reviewer_role() -> String {
    "sra".to_string()
}

fn default_currency() -> String {
    "PHP".to_string()
}

fn default_artifact_prefix() -> String {
    "reports".to_string()
}

fn default_true() -> bool {
    true
}

fn default_week_days() -> i64 {
    7
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reviewer_role: default_reviewer_role(),
            currency: default_currency(),
            artifact_prefix: default_artifact_prefix(),
            verify_after_delete: true,
            week_days: default_week_days(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("canemap")
}

pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Ignoring invalid settings at {}: {e}", path.display());
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| RecordsError::Settings(e.to_string()))?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}
