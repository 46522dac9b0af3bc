//! Config file loading with deep merge and environment overrides.
//!
//! Deep merge rules:
//! - Objects merge recursively (source overrides target per key)
//! - Arrays and primitives are replaced by source
//! - `null` in source is skipped

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::{beacon_home, BeaconConfig, ConfigError};

/// `~/.beacon/config.json`.
pub fn default_config_path() -> PathBuf {
    beacon_home().join("config.json")
}

pub fn load_config() -> Result<BeaconConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Defaults, then the file at `path` if present, then `BEACON_*` env vars,
/// then validation.
pub fn load_config_from_path(path: &Path) -> Result<BeaconConfig, ConfigError> {
    let defaults = serde_json::to_value(BeaconConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: BeaconConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validated()
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(config: &mut BeaconConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are ignored.
pub fn apply_overrides_from(config: &mut BeaconConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("BEACON_SERVER_URL") {
        config.server_url = v;
    }
    if let Some(v) = read("BEACON_APP_KEY") {
        config.app_key = v;
    }
    if let Some(v) = read("BEACON_UPLOAD_INTERVAL_MS").and_then(|v| parse_u64_range(&v, 1_000, 86_400_000)) {
        config.upload_interval_ms = v;
    }
    if let Some(v) = read("BEACON_BATCH_SIZE").and_then(|v| parse_u64_range(&v, 1, 10_000)) {
        config.batch_size = v as usize;
    }
    if let Some(v) = read("BEACON_DEBUG").and_then(|v| parse_bool(&v)) {
        config.debug_mode = v;
    }
    if let Some(v) = read("BEACON_DATABASE_PATH") {
        config.database_path = Some(v);
    }
    if let Some(v) = read("BEACON_ENCRYPTION_KEY") {
        config.encryption_key = Some(v);
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
