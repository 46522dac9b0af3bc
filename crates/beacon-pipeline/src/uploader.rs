//! Drains the outbox one batch at a time.
//!
//! `upload_once` never retries internally. Scheduling, backoff and
//! triggering live in the scheduler and the facade.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use beacon_core::{BatchId, BeaconConfig, Clock, Event, RemoteConfig};
use beacon_store::{EventQueue, QueueRecord};
use beacon_telemetry::{names, MetricsRecorder};

use crate::error::UploadError;
use crate::network::NetworkMonitor;
use crate::transport::{OutgoingBatch, Transport};
use crate::wire::UploadRequest;

/// Local, non-remote knobs for the coordinator.
#[derive(Clone, Debug)]
pub struct UploadSettings {
    pub app_key: String,
    pub max_retries: u32,
    pub purge_window_ms: i64,
    pub delivered_retention_ms: i64,
    pub upload_timeout: Option<Duration>,
}

impl UploadSettings {
    pub fn from_config(config: &BeaconConfig) -> Self {
        Self {
            app_key: config.app_key.clone(),
            max_retries: config.max_retries,
            purge_window_ms: i64::try_from(config.purge_window_ms).unwrap_or(i64::MAX),
            delivered_retention_ms: i64::try_from(config.delivered_retention_ms).unwrap_or(i64::MAX),
            upload_timeout: config.upload_timeout(),
        }
    }
}

pub struct UploadCoordinator {
    queue: EventQueue,
    transport: Arc<dyn Transport>,
    network: Arc<dyn NetworkMonitor>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
    settings: UploadSettings,
    remote: watch::Receiver<RemoteConfig>,
    /// Held for the whole of `upload_once`; contenders skip instead of waiting.
    in_flight: Mutex<()>,
}

impl UploadCoordinator {
    pub fn new(
        queue: EventQueue,
        transport: Arc<dyn Transport>,
        network: Arc<dyn NetworkMonitor>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRecorder>,
        settings: UploadSettings,
        remote: watch::Receiver<RemoteConfig>,
    ) -> Self {
        Self {
            queue,
            transport,
            network,
            clock,
            metrics,
            settings,
            remote,
            in_flight: Mutex::new(()),
        }
    }

    /// Batch size from the applied remote config, clamped to its maximum.
    pub fn batch_size(&self) -> usize {
        let rc = self.remote.borrow();
        rc.batch_size.clamp(1, rc.max_batch_size.max(1))
    }

    /// Deliver at most one batch. Returns how many events were accepted.
    #[instrument(skip(self))]
    pub async fn upload_once(&self) -> Result<usize, UploadError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("upload already in flight, skipping");
            return Err(UploadError::InFlight);
        };

        let started = Instant::now();
        let result = self.attempt().await;
        self.record(&result, started.elapsed());
        result
    }

    async fn attempt(&self) -> Result<usize, UploadError> {
        let mut records = self.queue.peek_batch(self.batch_size())?;
        if records.is_empty() {
            return Ok(0);
        }

        if !self.network.is_available().await {
            debug!(pending = records.len(), "network unavailable, deferring upload");
            return Err(UploadError::NetworkUnavailable);
        }

        // Poison-only batches are retired by decode_batch, so each pass
        // shrinks the queue until a sendable batch or an empty queue.
        let (ids, events) = loop {
            let (ids, events) = self.decode_batch(records)?;
            if !events.is_empty() {
                break (ids, events);
            }
            records = self.queue.peek_batch(self.batch_size())?;
            if records.is_empty() {
                return Ok(0);
            }
        };

        let body = serde_json::to_vec(&UploadRequest {
            events: &events,
            app_key: &self.settings.app_key,
            timestamp: self.clock.now_ms(),
        })
        .map_err(|e| UploadError::Serialization(e.to_string()))?;

        let batch = OutgoingBatch {
            batch_id: BatchId::new(),
            body,
            event_count: events.len(),
        };
        debug!(batch_id = %batch.batch_id, events = batch.event_count, "sending batch");

        let sent = match self.settings.upload_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.transport.send(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(UploadError::Timeout(limit)),
            },
            None => self.transport.send(&batch).await,
        };

        match sent {
            Ok(response) if response.success => {
                self.queue.mark_delivered(&ids)?;
                info!(
                    batch_id = %batch.batch_id,
                    delivered = ids.len(),
                    received = response.received_count,
                    "batch delivered"
                );
                self.purge();
                Ok(ids.len())
            }
            Ok(response) => {
                let message = response.message.unwrap_or_else(|| "no reason given".into());
                warn!(batch_id = %batch.batch_id, %message, "batch rejected by collector");
                Err(UploadError::Rejected { message })
            }
            Err(e) => {
                if e.penalizes_retry() {
                    if let Err(store_err) = self.queue.increment_retry(&ids) {
                        warn!(error = %store_err, "failed to record retry attempt");
                    }
                }
                warn!(batch_id = %batch.batch_id, error = %e, kind = e.error_kind(), "batch upload failed");
                Err(e)
            }
        }
    }

    /// Split into decodable events and poison payloads. Poison records are
    /// marked delivered so they cannot block the head of the queue.
    fn decode_batch(&self, records: Vec<QueueRecord>) -> Result<(Vec<i64>, Vec<Event>), UploadError> {
        let mut ids = Vec::with_capacity(records.len());
        let mut events = Vec::with_capacity(records.len());
        let mut poison = Vec::new();
        for record in records {
            match serde_json::from_slice::<Event>(&record.payload) {
                Ok(event) => {
                    ids.push(record.id);
                    events.push(event);
                }
                Err(e) => {
                    warn!(id = record.id, error = %e, "dropping undecodable outbox record");
                    poison.push(record.id);
                }
            }
        }
        if !poison.is_empty() {
            self.queue.mark_delivered(&poison)?;
            self.metrics
                .counter_inc(names::EVENTS_DROPPED, &[("reason", "poison")], poison.len() as u64);
        }
        Ok((ids, events))
    }

    /// Opportunistic cleanup after a successful upload. Failures are logged.
    fn purge(&self) {
        let now = self.clock.now_ms();
        match self
            .queue
            .purge_delivered(now.saturating_sub(self.settings.delivered_retention_ms))
        {
            Ok(n) if n > 0 => debug!(purged = n, "purged delivered records"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to purge delivered records"),
        }
        match self.queue.purge_exhausted(
            now.saturating_sub(self.settings.purge_window_ms),
            self.settings.max_retries,
        ) {
            Ok(n) if n > 0 => {
                self.metrics
                    .counter_inc(names::EVENTS_DROPPED, &[("reason", "exhausted")], n as u64);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to purge exhausted records"),
        }
    }

    fn record(&self, result: &Result<usize, UploadError>, elapsed: Duration) {
        let outcome = match result {
            Ok(0) => "empty",
            Ok(_) => "accepted",
            Err(e) => e.error_kind(),
        };
        self.metrics
            .counter_inc(names::UPLOAD_ATTEMPTS, &[("outcome", outcome)], 1);
        if let Ok(n) = result {
            if *n > 0 {
                self.metrics.counter_inc(names::UPLOAD_DELIVERED, &[], *n as u64);
                self.metrics
                    .histogram_observe(names::UPLOAD_DURATION_MS, &[], elapsed.as_secs_f64() * 1000.0);
            }
        }
        if let Ok(pending) = self.queue.pending_count() {
            self.metrics.gauge_set(names::QUEUE_PENDING, &[], pending as f64);
        }
    }
}
