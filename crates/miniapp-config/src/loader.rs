//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.miniapp/config.toml` (user)
//! 3. Merge the explicit `--config` file, if given
//! 4. Apply `MINIAPP_*` environment overrides
//! 5. Deserialize merged tree → `Config`
//! 6. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// Where configuration may come from, beyond the embedded defaults.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Directory holding the user `config.toml`. `None` uses `~/.miniapp`.
    pub user_dir: Option<PathBuf>,
    /// Explicit config file; must exist when given.
    pub explicit: Option<PathBuf>,
    /// Environment snapshot. `None` reads the process environment.
    pub env: Option<HashMap<String, String>>,
}

/// Load the configuration with full precedence.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, or if the
/// final merged configuration fails validation.
pub fn load(options: &LoadOptions) -> ConfigResult<Config> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    // User config.
    let user_path = options
        .user_dir
        .clone()
        .or_else(default_user_dir)
        .map(|dir| dir.join("config.toml"));
    if let Some(path) = user_path
        && let Some(overlay) = try_load_file(&path)?
    {
        deep_merge(&mut merged, &overlay);
        info!(path = %path.display(), "loaded user config");
    }

    // Explicit config.
    if let Some(path) = &options.explicit {
        let overlay = read_file(path)?;
        deep_merge(&mut merged, &overlay);
        info!(path = %path.display(), "loaded explicit config");
    }

    // Environment.
    let env = options.env.clone().unwrap_or_else(collect_env_vars);
    let applied = apply_env_overrides(&mut merged, &env)?;
    if applied > 0 {
        debug!(count = applied, "applied environment overrides");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;
    Ok(config)
}

/// Recursively deep-merge `overlay` into `base`.
///
/// - Tables merge recursively per-field.
/// - Scalars and arrays from the overlay **replace** the base value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// `~/.miniapp`, if a home directory can be determined.
fn default_user_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".miniapp"))
}

/// Read and parse a file that must exist.
fn read_file(path: &Path) -> ConfigResult<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_content(path, &content)
}

/// Try to load a file, returning `None` if the file doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };
    parse_content(path, &content).map(Some)
}

fn parse_content(path: &Path, content: &str) -> ConfigResult<toml::Value> {
    if content.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::invalid(
            &path.display().to_string(),
            format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        ));
    }
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })
}
