//! Server-tunable configuration with a persisted fallback.
//!
//! A successful fetch is sanitized, persisted with its fetch time, and
//! published on a `watch` channel. A failed fetch falls back to the last
//! persisted generation; with nothing persisted the failure is returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use beacon_core::{BeaconConfig, Clock, RemoteConfig};
use beacon_store::KvRepo;

use crate::error::FetchError;

/// Persisted configs older than this are refreshed.
pub const CONFIG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<RemoteConfig, FetchError>;
}

/// `GET {serverUrl}/config` with the app key as bearer token.
pub struct HttpConfigSource {
    client: Client,
    endpoint: String,
    app_key: String,
}

impl HttpConfigSource {
    pub fn new(config: &BeaconConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/config", config.server_url.trim_end_matches('/')),
            app_key: config.app_key.clone(),
        })
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<RemoteConfig, FetchError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.app_key)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        resp.json::<RemoteConfig>()
            .await
            .map_err(|e| FetchError::InvalidBody(e.to_string()))
    }
}

pub struct RemoteConfigFetcher {
    source: Arc<dyn ConfigSource>,
    kv: KvRepo,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    /// Minimum gap between attempts while the persisted config is expired.
    retry_gap_ms: i64,
    last_attempt_ms: Mutex<Option<i64>>,
    tx: watch::Sender<RemoteConfig>,
}

impl RemoteConfigFetcher {
    /// `defaults` is published until `bootstrap` or a fetch replaces it.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        kv: KvRepo,
        clock: Arc<dyn Clock>,
        defaults: RemoteConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(defaults);
        Self {
            source,
            kv,
            clock,
            ttl_ms: CONFIG_TTL.as_millis() as i64,
            retry_gap_ms: 0,
            last_attempt_ms: Mutex::new(None),
            tx,
        }
    }

    pub fn with_retry_gap(mut self, gap: Duration) -> Self {
        self.retry_gap_ms = i64::try_from(gap.as_millis()).unwrap_or(i64::MAX);
        self
    }

    /// Publish the persisted config, or keep the defaults on first run.
    pub fn bootstrap(&self) -> RemoteConfig {
        match self.kv.load_remote_config() {
            Ok(Some(persisted)) => {
                debug!(fetched_at = persisted.fetched_at, "bootstrapped remote config from disk");
                let config = persisted.config.sanitized();
                self.tx.send_replace(config.clone());
                config
            }
            Ok(None) => self.current(),
            Err(e) => {
                warn!(error = %e, "persisted remote config unreadable, using defaults");
                self.current()
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self) -> Result<RemoteConfig, FetchError> {
        let now = self.clock.now_ms();
        *self.last_attempt_ms.lock() = Some(now);

        match self.source.fetch().await {
            Ok(config) => {
                let config = config.sanitized();
                if let Err(e) = self.kv.save_remote_config(&config, now) {
                    warn!(error = %e, "failed to persist remote config");
                }
                info!(
                    batch_size = config.batch_size,
                    upload_interval_ms = config.upload_interval_ms,
                    sampling_rate = config.sampling_rate,
                    "remote config applied"
                );
                self.tx.send_replace(config.clone());
                Ok(config)
            }
            Err(fetch_err) => match self.kv.load_remote_config() {
                Ok(Some(persisted)) => {
                    warn!(error = %fetch_err, "remote config fetch failed, using persisted copy");
                    let config = persisted.config.sanitized();
                    self.tx.send_replace(config.clone());
                    Ok(config)
                }
                Ok(None) => {
                    warn!(error = %fetch_err, "remote config fetch failed, nothing persisted");
                    Err(fetch_err)
                }
                Err(e) => {
                    warn!(error = %fetch_err, store_error = %e, "remote config fetch failed, persisted copy unreadable");
                    Err(fetch_err)
                }
            },
        }
    }

    /// True when no config is persisted or the persisted one is past its TTL.
    pub fn is_expired(&self) -> bool {
        match self.kv.load_remote_config() {
            Ok(Some(persisted)) => self.clock.now_ms().saturating_sub(persisted.fetched_at) > self.ttl_ms,
            _ => true,
        }
    }

    /// Expired, and the last attempt (if any) is at least the retry gap ago.
    pub fn should_refresh(&self) -> bool {
        if !self.is_expired() {
            return false;
        }
        match *self.last_attempt_ms.lock() {
            Some(last) => self.clock.now_ms().saturating_sub(last) >= self.retry_gap_ms,
            None => true,
        }
    }

    pub fn current(&self) -> RemoteConfig {
        self.tx.borrow().clone()
    }

    pub fn with_current<R>(&self, f: impl FnOnce(&RemoteConfig) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<RemoteConfig> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConfigSource;
    use beacon_core::ManualClock;
    use beacon_store::Database;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(source: Arc<MockConfigSource>) -> (RemoteConfigFetcher, Arc<ManualClock>, KvRepo) {
        let kv = KvRepo::new(Database::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let f = RemoteConfigFetcher::new(source, kv.clone(), clock.clone(), RemoteConfig::default());
        (f, clock, kv)
    }

    fn config_with_batch(batch_size: usize) -> RemoteConfig {
        RemoteConfig {
            batch_size,
            ..RemoteConfig::default()
        }
    }

    #[tokio::test]
    async fn success_persists_and_publishes() {
        let (f, _clock, kv) = fetcher(Arc::new(MockConfigSource::serving(config_with_batch(7))));
        let mut rx = f.subscribe();

        let got = f.fetch().await.unwrap();
        assert_eq!(got.batch_size, 7);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().batch_size, 7);

        let persisted = kv.load_remote_config().unwrap().unwrap();
        assert_eq!(persisted.config.batch_size, 7);
        assert_eq!(persisted.fetched_at, 1_000_000);
    }

    #[tokio::test]
    async fn failure_falls_back_to_persisted() {
        let source = Arc::new(MockConfigSource::serving(config_with_batch(9)));
        let (f, _clock, _kv) = fetcher(source.clone());
        f.fetch().await.unwrap();
        source.set(None);
        let fallback = f.fetch().await.unwrap();
        assert_eq!(fallback.batch_size, 9);
    }

    #[tokio::test]
    async fn failure_without_persisted_is_error() {
        let (f, _clock, _kv) = fetcher(Arc::new(MockConfigSource::failing()));
        assert!(matches!(f.fetch().await, Err(FetchError::Status(503))));
        assert_eq!(f.current(), RemoteConfig::default());
    }

    #[tokio::test]
    async fn fetched_values_are_sanitized() {
        let wild = RemoteConfig {
            sampling_rate: 4.0,
            batch_size: 1_000,
            max_batch_size: 20,
            ..RemoteConfig::default()
        };
        let (f, _clock, _kv) = fetcher(Arc::new(MockConfigSource::serving(wild)));
        let got = f.fetch().await.unwrap();
        assert_eq!(got.sampling_rate, 1.0);
        assert_eq!(got.batch_size, 20);
    }

    #[tokio::test]
    async fn expiry_follows_ttl() {
        let (f, clock, _kv) = fetcher(Arc::new(MockConfigSource::serving(RemoteConfig::default())));
        assert!(f.is_expired());
        f.fetch().await.unwrap();
        assert!(!f.is_expired());

        clock.advance(CONFIG_TTL.as_millis() as i64);
        assert!(!f.is_expired());
        clock.advance(1);
        assert!(f.is_expired());
    }

    #[tokio::test]
    async fn retry_gap_throttles_refresh() {
        let (f, clock, _kv) = fetcher(Arc::new(MockConfigSource::failing()));
        let f = f.with_retry_gap(Duration::from_secs(60));
        assert!(f.should_refresh());
        let _ = f.fetch().await;
        assert!(!f.should_refresh());
        clock.advance(60_000);
        assert!(f.should_refresh());
    }

    #[test]
    fn bootstrap_prefers_persisted() {
        let (f, _clock, kv) = fetcher(Arc::new(MockConfigSource::failing()));
        assert_eq!(f.bootstrap(), RemoteConfig::default());

        let mut saved = RemoteConfig::default();
        saved.feature_flags.insert("beta".into(), true);
        kv.save_remote_config(&saved, 5).unwrap();
        assert!(f.bootstrap().flag("beta"));
        assert!(f.with_current(|c| c.flag("beta")));
    }

    #[tokio::test]
    async fn http_source_sends_bearer_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .and(header("authorization", "Bearer app-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uploadIntervalMs": 60000,
                "samplingRate": 0.5,
                "eventFilters": ["noisy"]
            })))
            .mount(&server)
            .await;

        let source = HttpConfigSource::new(&BeaconConfig::new(server.uri(), "app-key")).unwrap();
        let config = source.fetch().await.unwrap();
        assert_eq!(config.upload_interval_ms, 60_000);
        assert_eq!(config.sampling_rate, 0.5);
        assert!(config.is_filtered("noisy"));
        assert_eq!(config.batch_size, 50);
    }

    #[tokio::test]
    async fn http_source_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let source = HttpConfigSource::new(&BeaconConfig::new(server.uri(), "k")).unwrap();
        assert!(matches!(source.fetch().await, Err(FetchError::Status(404))));
    }
}
