//! Server configuration management
//!
//! Settings come from (highest precedence first) CLI flags, environment
//! variables, a config file, and built-in defaults. The file may be TOML or
//! JSON, chosen by extension; lookup order is the user-supplied path, then
//! the OS config directory, then defaults.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub usbip: UsbIpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "LogSettings::default_level")]
    pub level: String,
    /// Optional log file; console logging is always on.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            file: None,
        }
    }
}

impl LogSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Management API listen address
    #[serde(default = "ApiSettings::default_addr")]
    pub addr: String,
    /// Seconds an API connection may sit idle between request lines
    #[serde(default = "ApiSettings::default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Seconds before a device without an active stream is removed
    #[serde(default = "ApiSettings::default_device_timeout")]
    pub device_connect_timeout_secs: u64,
    /// Optional API key file path (defaults to the OS config dir)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: Self::default_addr(),
            read_timeout_secs: Self::default_read_timeout(),
            device_connect_timeout_secs: Self::default_device_timeout(),
            key_path: None,
        }
    }
}

impl ApiSettings {
    fn default_addr() -> String {
        "0.0.0.0:3242".to_string()
    }

    fn default_read_timeout() -> u64 {
        5
    }

    fn default_device_timeout() -> u64 {
        5
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn device_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.device_connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbIpSettings {
    /// USB/IP listen address
    #[serde(default = "UsbIpSettings::default_addr")]
    pub addr: String,
    /// Seconds allowed for writing one URB reply
    #[serde(default = "UsbIpSettings::default_write_timeout")]
    pub submit_write_timeout_secs: u64,
}

impl Default for UsbIpSettings {
    fn default() -> Self {
        Self {
            addr: Self::default_addr(),
            submit_write_timeout_secs: Self::default_write_timeout(),
        }
    }
}

impl UsbIpSettings {
    fn default_addr() -> String {
        "0.0.0.0:3240".to_string()
    }

    fn default_write_timeout() -> u64 {
        5
    }

    pub fn submit_write_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_write_timeout_secs)
    }
}

impl Config {
    /// Load configuration from `path`, or from the standard locations.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::candidate_paths().into_iter().find(|p| p.exists()) {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = if config_path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        };

        config.validate()?;
        tracing::debug!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save the configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("viiper").join("config.toml"));
            candidates.push(dir.join("viiper").join("config.json"));
        }
        candidates
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            ));
        }
        if self.api.addr.is_empty() || self.usbip.addr.is_empty() {
            return Err(anyhow!("listen addresses must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.api.addr, "0.0.0.0:3242");
        assert_eq!(config.usbip.addr, "0.0.0.0:3240");
        assert_eq!(config.api.device_connect_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.api.addr, config.api.addr);
        assert_eq!(parsed.log.level, config.log.level);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[api]\naddr = \"127.0.0.1:9000\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.api.addr, "127.0.0.1:9000");
        // Unset sections fall back to defaults.
        assert_eq!(config.usbip.addr, "0.0.0.0:3240");
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"log":{"level":"debug"}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[log]\nlevel = \"verbose\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/viiper.toml"))).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.api.device_connect_timeout_secs = 9;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.api.device_connect_timeout_secs, 9);
    }
}
