//! The host-facing handle.
//!
//! `Beacon` owns the outbox, the upload loop and the lifecycle. It is
//! constructed explicitly and cloned freely; clones share one state.
//!
//! ```text
//! Uninitialized ──start──▶ Running ──shutdown──▶ ShuttingDown ──▶ Stopped
//!       └──────────────────shutdown──────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use beacon_core::{
    BeaconConfig, Clock, ConfigError, DeviceContext, EventBuilder, EventContext, EventError,
    FieldCipher, Properties, RemoteConfig, Session, SystemClock,
};
use beacon_store::{Database, EventQueue, KvRepo};
use beacon_telemetry::{names, MetricsRecorder};

use crate::diagnostics::{DiagnosticsListener, UploadReport, UploadTrigger};
use crate::error::BeaconError;
use crate::network::{AlwaysOnline, NetworkMonitor};
use crate::processor::{CryptoErrorReporter, EventProcessor};
use crate::remote_config::{ConfigSource, HttpConfigSource, RemoteConfigFetcher};
use crate::retry::policy_for;
use crate::scheduler::UploadScheduler;
use crate::session::SessionTracker;
use crate::transport::{HttpTransport, Transport};
use crate::uploader::{UploadCoordinator, UploadSettings};

/// Grace period on top of the upload timeout when draining at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Injectable collaborators. Anything left unset gets the production default.
#[derive(Default)]
pub struct BeaconDeps {
    pub transport: Option<Arc<dyn Transport>>,
    pub config_source: Option<Arc<dyn ConfigSource>>,
    pub network: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Option<Arc<dyn Clock>>,
    pub database: Option<Database>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub listener: Option<Arc<dyn DiagnosticsListener>>,
    pub crypto_reporter: Option<CryptoErrorReporter>,
    pub device_context: DeviceContext,
}

impl BeaconDeps {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn DiagnosticsListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_crypto_reporter(mut self, reporter: CryptoErrorReporter) -> Self {
        self.crypto_reporter = Some(reporter);
        self
    }

    pub fn with_device_context(mut self, context: DeviceContext) -> Self {
        self.device_context = context;
        self
    }
}

#[derive(Default)]
struct UserState {
    user_id: Option<String>,
    properties: Properties,
}

struct Inner {
    config: BeaconConfig,
    state: Mutex<LifecycleState>,
    runtime: Mutex<Option<Handle>>,
    queue: EventQueue,
    kv: KvRepo,
    sessions: SessionTracker,
    processor: EventProcessor,
    coordinator: Arc<UploadCoordinator>,
    fetcher: Arc<RemoteConfigFetcher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
    listener: Option<Arc<dyn DiagnosticsListener>>,
    device_context: DeviceContext,
    user: RwLock<UserState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct Beacon {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beacon")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Beacon {
    /// Build every component without starting background work.
    pub fn new(config: BeaconConfig, deps: BeaconDeps) -> Result<Self, BeaconError> {
        let config = config.validated()?;

        let db = match deps.database {
            Some(db) => db,
            None => Database::open(&config.resolved_database_path())?,
        };
        let queue = EventQueue::new(db.clone());
        let kv = KvRepo::new(db);

        let clock = deps.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = deps.metrics.unwrap_or_default();
        let network = deps.network.unwrap_or_else(|| Arc::new(AlwaysOnline));
        let transport: Arc<dyn Transport> = match deps.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let source: Arc<dyn ConfigSource> = match deps.config_source {
            Some(s) => s,
            None => Arc::new(HttpConfigSource::new(&config)?),
        };

        let processor = if config.enable_encryption {
            let key = config
                .encryption_key
                .as_deref()
                .ok_or(ConfigError::MissingEncryptionKey)?;
            let processor = EventProcessor::with_cipher(FieldCipher::from_config_key(key)?);
            match deps.crypto_reporter {
                Some(reporter) => processor.with_reporter(reporter),
                None => processor,
            }
        } else {
            EventProcessor::passthrough()
        };

        let fetcher = Arc::new(
            RemoteConfigFetcher::new(source, kv.clone(), clock.clone(), RemoteConfig::from_local(&config))
                .with_retry_gap(config.failure_backoff()),
        );
        let coordinator = Arc::new(UploadCoordinator::new(
            queue.clone(),
            transport,
            network,
            clock.clone(),
            metrics.clone(),
            UploadSettings::from_config(&config),
            fetcher.subscribe(),
        ));

        let user_id = kv.load_user_id()?;
        let sessions = SessionTracker::new(config.session_timeout_ms, clock.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(LifecycleState::Uninitialized),
                runtime: Mutex::new(None),
                queue,
                kv,
                sessions,
                processor,
                coordinator,
                fetcher,
                clock,
                metrics,
                listener: deps.listener,
                device_context: deps.device_context,
                user: RwLock::new(UserState {
                    user_id,
                    properties: Properties::new(),
                }),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Build and start. Must be called from within a tokio runtime.
    pub fn init(config: BeaconConfig, deps: BeaconDeps) -> Result<Self, BeaconError> {
        let beacon = Self::new(config, deps)?;
        beacon.start()?;
        Ok(beacon)
    }

    /// Apply persisted remote config and spawn the upload loop on the
    /// current runtime. Starting a running instance is a no-op.
    pub fn start(&self) -> Result<(), BeaconError> {
        let mut state = self.inner.state.lock();
        match *state {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Uninitialized => {}
            other => return Err(BeaconError::NotRunning(other.as_str())),
        }
        let handle = Handle::try_current().map_err(|e| BeaconError::NoRuntime(e.to_string()))?;

        let applied = self.inner.fetcher.bootstrap();
        let scheduler = UploadScheduler::new(
            self.inner.coordinator.clone(),
            self.inner.fetcher.clone(),
            policy_for(&self.inner.config),
            self.inner.listener.clone(),
            self.inner.cancel.clone(),
        );
        self.inner.tasks.spawn_on(scheduler.run(), &handle);
        *self.inner.runtime.lock() = Some(handle);
        *state = LifecycleState::Running;

        info!(
            server_url = %self.inner.config.server_url,
            upload_interval_ms = applied.upload_interval_ms,
            batch_size = applied.batch_size,
            encryption = self.inner.config.enable_encryption,
            "beacon started"
        );
        Ok(())
    }

    /// Record an event without waiting for disk or network. Errors are logged
    /// and the event is dropped.
    pub fn track(&self, event: EventBuilder) {
        let handle = match self.admit(event.name()) {
            Ok(Some(handle)) => handle,
            Ok(None) => return,
            Err(e) => {
                warn!(event = event.name(), error = %e, "track dropped");
                return;
            }
        };
        let inner = self.inner.clone();
        self.inner.tasks.spawn_blocking_on(
            move || {
                if let Err(e) = inner.enqueue(event) {
                    warn!(error = %e, "failed to enqueue event");
                }
            },
            &handle,
        );
    }

    /// Like [`track`](Self::track) but waits for the write. Returns the
    /// outbox id, or `None` when sampling or filters dropped the event.
    pub async fn track_now(&self, event: EventBuilder) -> Result<Option<i64>, BeaconError> {
        let Some(handle) = self.admit(event.name())? else {
            return Ok(None);
        };
        let inner = self.inner.clone();
        let id = self
            .inner
            .tasks
            .spawn_blocking_on(move || inner.enqueue(event), &handle)
            .await
            .map_err(|e| BeaconError::Task(e.to_string()))??;
        Ok(Some(id))
    }

    /// Trigger one upload in the background.
    pub fn flush(&self) {
        let handle = match self.running_handle() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "flush dropped");
                return;
            }
        };
        let this = self.clone();
        self.inner.tasks.spawn_on(
            async move {
                if let Err(e) = this.flush_now().await {
                    debug!(error = %e, "background flush did not deliver");
                }
            },
            &handle,
        );
    }

    /// Run one upload and wait for it. A concurrent upload makes this
    /// return `UploadError::InFlight` without touching the network.
    #[instrument(skip(self))]
    pub async fn flush_now(&self) -> Result<usize, BeaconError> {
        self.running_handle()?;
        let result = self.inner.coordinator.upload_once().await;
        if let Some(listener) = &self.inner.listener {
            listener.on_upload(&UploadReport::from_result(UploadTrigger::Flush, &result));
        }
        Ok(result?)
    }

    /// Fetch remote config now, falling back to the persisted copy.
    pub async fn refresh_remote_config(&self) -> Result<RemoteConfig, BeaconError> {
        Ok(self.inner.fetcher.fetch().await?)
    }

    /// Stop the upload loop and wait for in-flight work. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                LifecycleState::Running => *state = LifecycleState::ShuttingDown,
                LifecycleState::Uninitialized => {
                    *state = LifecycleState::Stopped;
                    return;
                }
                LifecycleState::ShuttingDown | LifecycleState::Stopped => return,
            }
        }

        info!("beacon shutting down");
        self.inner.cancel.cancel();
        self.inner.tasks.close();

        let limit = self
            .inner
            .config
            .upload_timeout()
            .map_or(DEFAULT_SHUTDOWN_TIMEOUT, |t| t + SHUTDOWN_GRACE);
        if tokio::time::timeout(limit, self.inner.tasks.wait()).await.is_err() {
            warn!(timeout = ?limit, "shutdown timed out with tasks still running");
        }

        *self.inner.state.lock() = LifecycleState::Stopped;
        info!("beacon stopped");
    }

    /// Persist the user id attached to subsequent events. Clearing it starts
    /// a new session.
    pub fn set_user_id(&self, user_id: Option<String>) -> Result<(), BeaconError> {
        let user_id = user_id.filter(|id| !id.trim().is_empty());
        self.inner
            .kv
            .save_user_id(user_id.as_deref(), self.inner.clock.now_ms())?;
        let logged_out = user_id.is_none();
        self.inner.user.write().user_id = user_id;
        if logged_out {
            self.inner.sessions.reset();
        }
        Ok(())
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user.read().user_id.clone()
    }

    /// Merge into the user properties attached to subsequent events.
    pub fn set_user_properties(&self, properties: Properties) {
        self.inner.user.write().properties.extend(properties);
    }

    /// Unknown flags are off.
    pub fn feature_flag(&self, name: &str) -> bool {
        self.inner.fetcher.with_current(|rc| rc.flag(name))
    }

    pub fn remote_config(&self) -> RemoteConfig {
        self.inner.fetcher.current()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<RemoteConfig> {
        self.inner.fetcher.subscribe()
    }

    pub fn pending_count(&self) -> Result<usize, BeaconError> {
        Ok(self.inner.queue.pending_count()?)
    }

    /// Enqueue time (epoch ms) of the oldest undelivered event.
    pub fn oldest_pending_at(&self) -> Result<Option<i64>, BeaconError> {
        Ok(self.inner.queue.oldest_pending_at()?)
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.sessions.peek()
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.inner.metrics.clone()
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.inner.config
    }

    fn running_handle(&self) -> Result<Handle, BeaconError> {
        let state = *self.inner.state.lock();
        if state != LifecycleState::Running {
            return Err(BeaconError::NotRunning(state.as_str()));
        }
        self.inner
            .runtime
            .lock()
            .clone()
            .ok_or(BeaconError::NotRunning(state.as_str()))
    }

    /// Gate shared by both track paths. `Ok(None)` means filtered or
    /// sampled out, already counted.
    fn admit(&self, name: &str) -> Result<Option<Handle>, BeaconError> {
        let handle = self.running_handle()?;
        if name.is_empty() {
            return Err(EventError::EmptyName.into());
        }
        let dropped = self.inner.fetcher.with_current(|rc| {
            if rc.is_filtered(name) {
                Some("filtered")
            } else if !rc.should_sample(rand::random::<f64>()) {
                Some("sampled")
            } else {
                None
            }
        });
        if let Some(reason) = dropped {
            debug!(event = name, reason, "event dropped before enqueue");
            self.inner
                .metrics
                .counter_inc(names::EVENTS_DROPPED, &[("reason", reason)], 1);
            return Ok(None);
        }
        Ok(Some(handle))
    }
}

impl Inner {
    fn enqueue(&self, event: EventBuilder) -> Result<i64, BeaconError> {
        let now = self.clock.now_ms();
        let ctx = {
            let user = self.user.read();
            EventContext {
                session_id: self.sessions.current_session_id(),
                user_id: user.user_id.clone(),
                device_context: self.device_context.clone(),
                user_properties: user.properties.clone(),
                now_ms: now,
            }
        };
        let event = self.processor.process(event.build(ctx)?);
        let payload = serde_json::to_vec(&event)?;
        let outcome = self
            .queue
            .enqueue_bounded(&payload, now, self.config.max_queue_size)?;

        self.metrics.counter_inc(names::EVENTS_TRACKED, &[], 1);
        if outcome.evicted > 0 {
            warn!(evicted = outcome.evicted, "outbox full, dropped oldest events");
            self.metrics.counter_inc(
                names::EVENTS_DROPPED,
                &[("reason", "backpressure")],
                outcome.evicted as u64,
            );
        }
        debug!(id = outcome.id, event = event.name(), session_id = %event.session_id(), "event enqueued");
        Ok(outcome.id)
    }
}
