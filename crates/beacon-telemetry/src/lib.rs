mod metrics;

pub use metrics::{names, HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "beacon_pipeline" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stderr instead of the human-readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// `debugMode` raises the default level to DEBUG.
    pub fn from_debug(debug_mode: bool) -> Self {
        Self {
            log_level: if debug_mode { Level::DEBUG } else { Level::INFO },
            ..Self::default()
        }
    }

    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the metrics recorder alive for the life of the process.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Install the global subscriber. Call once at startup; a second call keeps
/// the existing subscriber and still returns a fresh guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let pretty_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
    {
        eprintln!("beacon-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_mode_raises_level() {
        assert_eq!(TelemetryConfig::from_debug(true).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_debug(false).log_level, Level::INFO);
    }

    #[test]
    fn filter_directive_includes_modules() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("beacon_store".into(), Level::TRACE)],
            json: true,
        };
        assert_eq!(config.filter_directive(), "warn,beacon_store=trace");
    }

    #[test]
    fn guard_hands_out_one_recorder() {
        let guard = init_telemetry(TelemetryConfig::default());
        guard.metrics().counter_inc("ticks", &[], 2);
        assert_eq!(guard.metrics().counter_get("ticks", &[]), 2);
    }

    #[test]
    fn repeated_init_does_not_panic() {
        let first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        first.metrics().counter_inc("x", &[], 1);
        assert_eq!(second.metrics().counter_get("x", &[]), 0);
    }
}
