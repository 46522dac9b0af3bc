use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::BeaconConfig;

/// Floor for a server-supplied upload interval.
pub const MIN_UPLOAD_INTERVAL_MS: u64 = 1_000;

/// Server-tunable delivery parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub upload_interval_ms: u64,
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub sampling_rate: f64,
    pub event_filters: BTreeSet<String>,
    pub feature_flags: BTreeMap<String, bool>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::from_local(&BeaconConfig::default())
    }
}

impl RemoteConfig {
    /// Seed from local configuration, used before any fetch succeeds.
    pub fn from_local(config: &BeaconConfig) -> Self {
        Self {
            upload_interval_ms: config.upload_interval_ms,
            batch_size: config.batch_size,
            max_batch_size: config.max_batch_size,
            sampling_rate: 1.0,
            event_filters: BTreeSet::new(),
            feature_flags: BTreeMap::new(),
        }
    }

    /// Clamp server-supplied values into safe ranges.
    pub fn sanitized(mut self) -> Self {
        if !self.sampling_rate.is_finite() {
            self.sampling_rate = 1.0;
        }
        self.sampling_rate = self.sampling_rate.clamp(0.0, 1.0);
        self.max_batch_size = self.max_batch_size.max(1);
        self.batch_size = self.batch_size.clamp(1, self.max_batch_size);
        self.upload_interval_ms = self.upload_interval_ms.max(MIN_UPLOAD_INTERVAL_MS);
        self
    }

    pub fn is_filtered(&self, event_name: &str) -> bool {
        self.event_filters.contains(event_name)
    }

    /// Unknown flags are off.
    pub fn flag(&self, name: &str) -> bool {
        self.feature_flags.get(name).copied().unwrap_or(false)
    }

    /// `roll` is a uniform sample from `[0, 1)`.
    pub fn should_sample(&self, roll: f64) -> bool {
        roll < self.sampling_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_ranges() {
        let rc = RemoteConfig {
            upload_interval_ms: 10,
            batch_size: 500,
            max_batch_size: 0,
            sampling_rate: 3.5,
            ..RemoteConfig::default()
        }
        .sanitized();
        assert_eq!(rc.upload_interval_ms, MIN_UPLOAD_INTERVAL_MS);
        assert_eq!(rc.max_batch_size, 1);
        assert_eq!(rc.batch_size, 1);
        assert_eq!(rc.sampling_rate, 1.0);
    }

    #[test]
    fn nan_sampling_rate_means_keep_all() {
        let rc = RemoteConfig {
            sampling_rate: f64::NAN,
            ..RemoteConfig::default()
        }
        .sanitized();
        assert_eq!(rc.sampling_rate, 1.0);
    }

    #[test]
    fn negative_sampling_rate_drops_all() {
        let rc = RemoteConfig {
            sampling_rate: -1.0,
            ..RemoteConfig::default()
        }
        .sanitized();
        assert!(!rc.should_sample(0.0));
    }

    #[test]
    fn filters_and_flags() {
        let rc: RemoteConfig = serde_json::from_str(
            r#"{"eventFilters":["debug_ping"],"featureFlags":{"new_checkout":true}}"#,
        )
        .unwrap();
        assert!(rc.is_filtered("debug_ping"));
        assert!(!rc.is_filtered("purchase"));
        assert!(rc.flag("new_checkout"));
        assert!(!rc.flag("unknown"));
        assert_eq!(rc.batch_size, 50);
    }

    #[test]
    fn sampling_threshold() {
        let rc = RemoteConfig {
            sampling_rate: 0.25,
            ..RemoteConfig::default()
        };
        assert!(rc.should_sample(0.1));
        assert!(!rc.should_sample(0.25));
        assert!(!rc.should_sample(0.9));
    }
}
