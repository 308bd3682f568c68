//! Configuration loading and management

use anyhow::Context;
use kdbx_core::CodecConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Limits and block size handed to the codec
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub save: SaveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    /// Format written by `resave` when `--format` is not given, e.g. "4.0"
    pub format: Option<String>,
    /// Keep the previous file as `<name>.bak` when saving in place
    #[serde(default = "default_true")]
    pub backup: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            format: None,
            backup: true,
        }
    }
}

impl Config {
    /// Load configuration from `explicit`, the standard locations, or defaults
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let config_paths: Vec<PathBuf> = vec![
            Some(PathBuf::from("kdbx-tool.toml")),
            Some(PathBuf::from("config.toml")),
            dirs_config_path(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::debug!("Using default configuration");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }
}

fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kdbx-tool").join("config.toml"))
}

/// Helper to get user's config directory
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            None
        }
    }
}
