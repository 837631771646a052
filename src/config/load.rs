use super::{ConfigError, ProcessDefinition, RuntimeSettings};
use super::settings::{DEFAULT_SETTINGS_FILE, SETTINGS_ENV_VAR};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Resolves the settings file: explicit path, then `PROCFLOW_SETTINGS`, then
/// `./procflow.yaml`. Returns `None` when no file applies.
pub fn resolve_settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(raw) = std::env::var(SETTINGS_ENV_VAR) {
        if !raw.trim().is_empty() {
            return Some(PathBuf::from(raw));
        }
    }
    let local = PathBuf::from(DEFAULT_SETTINGS_FILE);
    local.is_file().then_some(local)
}

pub fn load_settings(explicit: Option<&Path>) -> Result<RuntimeSettings, ConfigError> {
    match resolve_settings_path(explicit) {
        Some(path) => RuntimeSettings::from_path(&path),
        None => {
            let settings = RuntimeSettings::default();
            settings.validate()?;
            Ok(settings)
        }
    }
}

pub fn load_process_definition(path: &Path) -> Result<ProcessDefinition, ConfigError> {
    let definition = ProcessDefinition::from_path(path)?;
    definition.validate()?;
    Ok(definition)
}

pub fn load_inputs_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::ParseJson {
        path: path.display().to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::Settings(format!(
            "inputs file {} must contain a JSON object",
            path.display()
        ))),
    }
}
