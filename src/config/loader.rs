//! Config file loader and override merging.
//!
//! Resolution order is fixed: built-in defaults (through `#[serde(default)]`),
//! then the config file, then `section.key=value` overrides. The merged
//! document is deserialized exactly once.

use super::{validator, BuildConfiguration};
use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config location: ~/.config/ffu-builder/config.toml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ffu-builder").join("config.toml"))
}

/// Load, merge and validate the build configuration.
///
/// `file` of None falls back to `default_config_path()` when that file exists,
/// otherwise the defaults are used as the base document.
pub fn resolve(file: Option<&Path>, overrides: &[String]) -> Result<BuildConfiguration, ConfigError> {
    let mut doc = match file {
        Some(path) => load_document(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                log::info!("[Config] Using default config file {}", path.display());
                load_document(&path)?
            }
            None => toml::Value::Table(toml::Table::new()),
        },
    };

    for raw in overrides {
        let (key_path, value) = parse_override(raw)?;
        apply_override(&mut doc, &key_path, value)?;
    }

    let config = BuildConfiguration::deserialize(doc).map_err(|e| ConfigError::InvalidToml(e.to_string()))?;

    validator::validate(&config)?;
    Ok(config)
}

/// Read a config document. `.toml` and `.json` are accepted.
pub fn load_document(path: &Path) -> Result<toml::Value, ConfigError> {
    validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.display().to_string())
        } else {
            ConfigError::IoError(e)
        }
    })?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let json: serde_json::Value = serde_json::from_str(&content)?;
            json_to_toml(json)
                .ok_or_else(|| ConfigError::ValidationFailed("JSON config must be an object".to_string()))
        }
        _ => toml::from_str::<toml::Value>(&content).map_err(|e| ConfigError::InvalidToml(e.to_string())),
    }
}

/// Validate config path (.toml or .json extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") | Some("json") => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Configuration file must have .toml or .json extension, got .{}",
            ext
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Configuration file must have .toml or .json extension".to_string(),
        )),
    }
}

/// Split `vm.memory_mb=4096` into its key path and a typed value.
///
/// The value is read as a TOML literal when it parses as one (numbers, booleans,
/// arrays, quoted strings); anything else is taken as a plain string.
pub fn parse_override(raw: &str) -> Result<(Vec<String>, toml::Value), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;

    let key_path: Vec<String> = key.trim().split('.').map(|s| s.trim().to_string()).collect();
    if key_path.iter().any(|k| k.is_empty()) {
        return Err(ConfigError::InvalidOverride(raw.to_string()));
    }

    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {}", value))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));

    Ok((key_path, parsed))
}

fn apply_override(doc: &mut toml::Value, key_path: &[String], value: toml::Value) -> Result<(), ConfigError> {
    let Some((last, parents)) = key_path.split_last() else {
        return Err(ConfigError::InvalidOverride(String::new()));
    };

    let mut cursor = doc;
    for key in parents {
        let table = cursor.as_table_mut().ok_or_else(|| {
            ConfigError::InvalidOverride(format!("{} is not a table", key_path.join(".")))
        })?;
        cursor = table
            .entry(key.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }

    cursor
        .as_table_mut()
        .ok_or_else(|| ConfigError::InvalidOverride(format!("{} is not a table", key_path.join("."))))?
        .insert(last.clone(), value);
    Ok(())
}

fn json_to_toml(value: serde_json::Value) -> Option<toml::Value> {
    use serde_json::Value as J;
    match value {
        J::Null => None,
        J::Bool(b) => Some(toml::Value::Boolean(b)),
        J::Number(n) => n
            .as_i64()
            .map(toml::Value::Integer)
            .or_else(|| n.as_f64().map(toml::Value::Float)),
        J::String(s) => Some(toml::Value::String(s)),
        J::Array(items) => Some(toml::Value::Array(
            items.into_iter().filter_map(json_to_toml).collect(),
        )),
        J::Object(map) => Some(toml::Value::Table(
            map.into_iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k, v)))
                .collect(),
        )),
    }
}
