//! API key persistence
//!
//! Clients authenticate with an opaque shared key stored next to the server
//! configuration. The key file is created on first use so that fresh
//! installations work without a provisioning step.
//!
//! Keys are stored in OS-standard locations:
//! - Linux: `~/.config/viiper/apikey`
//! - macOS: `~/Library/Application Support/viiper/apikey`
//! - Windows: `%APPDATA%\viiper\apikey`

use anyhow::{Context, Result, bail};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Application name for config directory lookup
const APP_NAME: &str = "viiper";

/// Key filename inside the config directory
const API_KEY_FILENAME: &str = "apikey";

/// Length of a generated key in bytes
const API_KEY_LENGTH: usize = 32;

/// Get the default API key path using OS config-dir conventions
pub fn default_api_key_path() -> Result<PathBuf> {
    let config_dir =
        dirs::config_dir().context("Failed to determine config directory (HOME not set?)")?;
    Ok(config_dir.join(APP_NAME).join(API_KEY_FILENAME))
}

/// Load the API key, generating and persisting one if none exists
///
/// # Arguments
/// * `path` - Optional key file path. If None, uses the default location.
pub fn load_or_generate_api_key(path: Option<&Path>) -> Result<Vec<u8>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_api_key_path()?,
    };

    if path.exists() {
        let key = fs::read(&path)
            .with_context(|| format!("Failed to read API key file: {}", path.display()))?;
        if key.is_empty() {
            bail!("API key file is empty: {}", path.display());
        }
        debug!("Loaded API key from {}", path.display());
        return Ok(key);
    }

    let mut key = vec![0u8; API_KEY_LENGTH];
    rand::rng().fill_bytes(&mut key);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }
    fs::write(&path, &key)
        .with_context(|| format!("Failed to write API key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict key permissions: {}", path.display()))?;
    }

    info!("Generated new API key at {}", path.display());
    Ok(key)
}
