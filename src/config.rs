//! Sharing configuration, loadable from YAML.

use crate::frame::TextureTarget;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default directory pump interval in milliseconds.
const DEFAULT_RUN_LOOP_INTERVAL_MS: u64 = 1000;

/// Settings shared by the directory, publishers and subscribers of one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Owning-application name announced by publishers (default: executable name)
    pub app_name: Option<String>,
    /// Image announced as the server icon
    pub icon: Option<PathBuf>,
    /// How long one directory pump may block
    pub run_loop_interval_ms: u64,
    /// Default for `PublishOptions::auto_commit`
    pub auto_commit: bool,
    /// Texture layout legacy-immediate subscribers import frames into
    pub client_target: TextureTarget,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            app_name: None,
            icon: None,
            run_loop_interval_ms: DEFAULT_RUN_LOOP_INTERVAL_MS,
            auto_commit: true,
            client_target: TextureTarget::Rectangle,
        }
    }
}

impl ShareConfig {
    /// Parse a configuration from YAML. Missing keys take their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse share config")
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_yaml_str(&content)?;
        info!("Loaded share config from {:?}", path);
        Ok(config)
    }

    pub fn run_loop_interval(&self) -> Duration {
        Duration::from_millis(self.run_loop_interval_ms)
    }

    /// The application name publishers announce.
    pub fn resolved_app_name(&self) -> String {
        if let Some(name) = &self.app_name {
            return name.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "texshare".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_keys_take_defaults() {
        let config = ShareConfig::from_yaml_str("app_name: Demo\n").unwrap();
        assert_eq!(config.app_name.as_deref(), Some("Demo"));
        assert_eq!(config.run_loop_interval(), Duration::from_secs(1));
        assert!(config.auto_commit);
        assert_eq!(config.client_target, TextureTarget::Rectangle);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "run_loop_interval_ms: 20\nauto_commit: false\nclient_target: texture_2d").unwrap();
        let config = ShareConfig::load(file.path()).unwrap();
        assert_eq!(config.run_loop_interval(), Duration::from_millis(20));
        assert!(!config.auto_commit);
        assert_eq!(config.client_target, TextureTarget::Texture2D);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(ShareConfig::from_yaml_str("run_loop_interval_ms: [1, 2]").is_err());
    }

    #[test]
    fn test_explicit_app_name_wins() {
        let config = ShareConfig { app_name: Some("Mixer".into()), ..Default::default() };
        assert_eq!(config.resolved_app_name(), "Mixer");
    }
}
