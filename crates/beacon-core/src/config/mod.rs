//! Client configuration.
//!
//! Loaded in layers (lowest to highest priority):
//! 1. Compiled defaults, [`BeaconConfig::default()`]
//! 2. A JSON file deep-merged over the defaults
//! 3. `BEACON_*` environment overrides
//!
//! [`BeaconConfig::validated`] then fails fast on missing required fields
//! and clamps out-of-range tuning values.

mod loader;

pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, default_config_path, load_config,
    load_config_from_path, parse_bool, parse_u64_range,
};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_UPLOAD_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_PURGE_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const DEFAULT_DELIVERED_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_FAILURE_BACKOFF_MS: u64 = 300_000;
pub const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("encryption is enabled but no encryptionKey is configured")]
    MissingEncryptionKey,
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryStrategy {
    /// Normal interval on success, one fixed longer interval after a failure.
    #[default]
    DualRate,
    /// Doubling delay per consecutive failure, capped, with jitter.
    Exponential,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconConfig {
    pub server_url: String,
    pub app_key: String,
    pub upload_interval_ms: u64,
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub enable_encryption: bool,
    pub encryption_key: Option<String>,
    pub session_timeout_ms: u64,
    pub debug_mode: bool,
    pub database_path: Option<String>,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub purge_window_ms: u64,
    pub delivered_retention_ms: u64,
    pub failure_backoff_ms: u64,
    pub upload_timeout_ms: Option<u64>,
    pub enable_compression: bool,
    pub compression_fallback: bool,
    pub retry_strategy: RetryStrategy,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            app_key: String::new(),
            upload_interval_ms: DEFAULT_UPLOAD_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            enable_encryption: false,
            encryption_key: None,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            debug_mode: false,
            database_path: None,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            purge_window_ms: DEFAULT_PURGE_WINDOW_MS,
            delivered_retention_ms: DEFAULT_DELIVERED_RETENTION_MS,
            failure_backoff_ms: DEFAULT_FAILURE_BACKOFF_MS,
            upload_timeout_ms: Some(DEFAULT_UPLOAD_TIMEOUT_MS),
            enable_compression: false,
            compression_fallback: false,
            retry_strategy: RetryStrategy::DualRate,
        }
    }
}

impl std::fmt::Debug for BeaconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconConfig")
            .field("server_url", &self.server_url)
            .field("app_key", &redact(&self.app_key))
            .field("upload_interval_ms", &self.upload_interval_ms)
            .field("batch_size", &self.batch_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("enable_encryption", &self.enable_encryption)
            .field("encryption_key", &self.encryption_key.as_deref().map(redact))
            .field("session_timeout_ms", &self.session_timeout_ms)
            .field("debug_mode", &self.debug_mode)
            .field("database_path", &self.database_path)
            .field("max_queue_size", &self.max_queue_size)
            .field("max_retries", &self.max_retries)
            .field("retry_strategy", &self.retry_strategy)
            .finish_non_exhaustive()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl BeaconConfig {
    pub fn new(server_url: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            app_key: app_key.into(),
            ..Self::default()
        }
    }

    /// Check required fields and clamp tuning values into range.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_owned();
        if self.server_url.is_empty() {
            return Err(ConfigError::MissingField("serverUrl"));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(format!(
                "serverUrl must be an http(s) URL, got {}",
                self.server_url
            )));
        }
        if self.app_key.trim().is_empty() {
            return Err(ConfigError::MissingField("appKey"));
        }
        if self.enable_encryption
            && !matches!(self.encryption_key.as_deref(), Some(k) if !k.trim().is_empty())
        {
            return Err(ConfigError::MissingEncryptionKey);
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue("maxQueueSize must be at least 1".into()));
        }
        if self.upload_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("uploadIntervalMs must be positive".into()));
        }

        if self.max_batch_size == 0 {
            warn!("maxBatchSize of 0 raised to 1");
            self.max_batch_size = 1;
        }
        if self.batch_size == 0 || self.batch_size > self.max_batch_size {
            let clamped = self.batch_size.clamp(1, self.max_batch_size);
            warn!(
                batch_size = self.batch_size,
                max_batch_size = self.max_batch_size,
                clamped,
                "batchSize out of range, clamping"
            );
            self.batch_size = clamped;
        }
        if self.failure_backoff_ms < self.upload_interval_ms {
            warn!(
                failure_backoff_ms = self.failure_backoff_ms,
                upload_interval_ms = self.upload_interval_ms,
                "failureBackoffMs shorter than uploadIntervalMs, raising"
            );
            self.failure_backoff_ms = self.upload_interval_ms;
        }
        if self.upload_timeout_ms == Some(0) {
            self.upload_timeout_ms = None;
        }
        Ok(self)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_ms.map(Duration::from_millis)
    }

    /// Configured database path, or `~/.beacon/outbox.db`.
    pub fn resolved_database_path(&self) -> PathBuf {
        match self.database_path.as_deref().filter(|p| !p.is_empty()) {
            Some(p) => PathBuf::from(p),
            None => beacon_home().join("outbox.db"),
        }
    }
}

pub(crate) fn beacon_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".beacon")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BeaconConfig {
        BeaconConfig::new("https://collector.example.com", "app-key")
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = BeaconConfig::default();
        assert_eq!(c.upload_interval_ms, 30_000);
        assert_eq!(c.batch_size, 50);
        assert_eq!(c.max_batch_size, 100);
        assert_eq!(c.session_timeout_ms, 1_800_000);
        assert_eq!(c.max_queue_size, 10_000);
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.failure_backoff_ms, 300_000);
        assert_eq!(c.upload_timeout_ms, Some(30_000));
        assert!(!c.enable_encryption);
        assert!(!c.enable_compression);
        assert_eq!(c.retry_strategy, RetryStrategy::DualRate);
    }

    #[test]
    fn empty_server_url_rejected() {
        let err = BeaconConfig::new("  ", "k").validated().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("serverUrl")));
    }

    #[test]
    fn empty_app_key_rejected() {
        let err = BeaconConfig::new("https://x", "").validated().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("appKey")));
    }

    #[test]
    fn non_http_url_rejected() {
        let err = BeaconConfig::new("ftp://x", "k").validated().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn encryption_requires_key() {
        let mut c = valid();
        c.enable_encryption = true;
        assert!(matches!(c.clone().validated(), Err(ConfigError::MissingEncryptionKey)));
        c.encryption_key = Some("passphrase".into());
        assert!(c.validated().is_ok());
    }

    #[test]
    fn trailing_slash_trimmed() {
        let c = BeaconConfig::new("https://x.example/", "k").validated().unwrap();
        assert_eq!(c.server_url, "https://x.example");
    }

    #[test]
    fn batch_size_clamped_to_max() {
        let mut c = valid();
        c.batch_size = 500;
        c.max_batch_size = 100;
        assert_eq!(c.validated().unwrap().batch_size, 100);

        let mut c = valid();
        c.batch_size = 0;
        assert_eq!(c.validated().unwrap().batch_size, 1);
    }

    #[test]
    fn zero_queue_size_rejected() {
        let mut c = valid();
        c.max_queue_size = 0;
        assert!(matches!(c.validated(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn zero_timeout_disables_it() {
        let mut c = valid();
        c.upload_timeout_ms = Some(0);
        assert_eq!(c.validated().unwrap().upload_timeout(), None);
    }

    #[test]
    fn backoff_never_shorter_than_interval() {
        let mut c = valid();
        c.upload_interval_ms = 60_000;
        c.failure_backoff_ms = 1_000;
        assert_eq!(c.validated().unwrap().failure_backoff_ms, 60_000);
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let c: BeaconConfig = serde_json::from_str(
            r#"{"serverUrl":"https://x","appKey":"k","batchSize":2,"retryStrategy":"exponential"}"#,
        )
        .unwrap();
        assert_eq!(c.batch_size, 2);
        assert_eq!(c.max_batch_size, 100);
        assert_eq!(c.retry_strategy, RetryStrategy::Exponential);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut c = valid();
        c.encryption_key = Some("hunter2".into());
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("app-key"));
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("collector.example.com"));
    }

    #[test]
    fn explicit_database_path_wins() {
        let mut c = valid();
        c.database_path = Some("/tmp/x.db".into());
        assert_eq!(c.resolved_database_path(), PathBuf::from("/tmp/x.db"));
        c.database_path = None;
        assert!(c.resolved_database_path().ends_with(".beacon/outbox.db"));
    }
}
