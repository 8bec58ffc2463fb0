//! Configuration loading from `~/.memvault/config.toml` with defaults, and
//! partial runtime updates.

use memvault_types::config::{default_home_dir, StoreConfig};
use memvault_types::error::{MemoryError, MemoryResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load store configuration from a TOML file, with defaults.
///
/// A missing, unreadable, unparsable or invalid file falls back to
/// [`StoreConfig::default`] with a warning.
pub fn load_config(path: Option<&Path>) -> StoreConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return StoreConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return StoreConfig::default();
        }
    };
    match toml::from_str::<StoreConfig>(&contents) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Invalid config values, using defaults"
                );
                StoreConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            StoreConfig::default()
        }
    }
}

/// Strict variant of [`load_config`] for callers that must not fall back.
pub fn read_config(path: &Path) -> MemoryResult<StoreConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MemoryError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let config: StoreConfig = toml::from_str(&contents).map_err(|e| {
        MemoryError::Config(format!("cannot parse config '{}': {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Deep-merge two JSON values. `overlay` values override `base` values.
/// For objects, recursively merge. For everything else, overlay wins.
pub fn deep_merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge_json(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Apply a partial JSON update on top of `current` and validate the result.
///
/// The patch must be an object whose keys are config fields (camelCase).
/// Unknown keys and ill-typed values are validation errors.
pub fn apply_update(current: &StoreConfig, patch: &serde_json::Value) -> MemoryResult<StoreConfig> {
    let serde_json::Value::Object(fields) = patch else {
        return Err(MemoryError::Validation(
            "configuration update must be a JSON object".into(),
        ));
    };
    let mut merged =
        serde_json::to_value(current).map_err(|e| MemoryError::Serialization(e.to_string()))?;
    if let serde_json::Value::Object(known) = &merged {
        if let Some(unknown) = fields.keys().find(|k| !known.contains_key(*k)) {
            return Err(MemoryError::Validation(format!(
                "unknown configuration field '{unknown}'"
            )));
        }
    }
    deep_merge_json(&mut merged, patch);
    let next: StoreConfig = serde_json::from_value(merged)
        .map_err(|e| MemoryError::Validation(format!("invalid configuration: {e}")))?;
    next.validate()?;
    Ok(next)
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    default_home_dir().join("config.toml")
}
