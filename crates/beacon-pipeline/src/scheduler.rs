//! Periodic upload loop.
//!
//! Each tick refreshes remote config when it is due, sleeps for the delay the
//! retry policy picks, then runs one upload. Cancellation interrupts the
//! refresh and the sleep but never an upload already started.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticsListener, UploadReport, UploadTrigger};
use crate::error::UploadError;
use crate::remote_config::RemoteConfigFetcher;
use crate::retry::RetryPolicy;
use crate::uploader::UploadCoordinator;

pub struct UploadScheduler {
    coordinator: Arc<UploadCoordinator>,
    fetcher: Arc<RemoteConfigFetcher>,
    policy: Box<dyn RetryPolicy>,
    listener: Option<Arc<dyn DiagnosticsListener>>,
    cancel: CancellationToken,
}

impl UploadScheduler {
    pub fn new(
        coordinator: Arc<UploadCoordinator>,
        fetcher: Arc<RemoteConfigFetcher>,
        policy: Box<dyn RetryPolicy>,
        listener: Option<Arc<dyn DiagnosticsListener>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            fetcher,
            policy,
            listener,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        let mut failures: u32 = 0;
        info!("upload scheduler started");

        loop {
            tokio::select! {
                () = self.refresh_if_due() => {}
                () = self.cancel.cancelled() => break,
            }

            let interval = self
                .fetcher
                .with_current(|rc| Duration::from_millis(rc.upload_interval_ms));
            let delay = self.policy.next_delay(interval, failures);
            debug!(delay_ms = delay.as_millis() as u64, failures, "next upload tick");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => break,
            }

            let result = self.coordinator.upload_once().await;
            failures = next_failure_count(failures, &result);
            if let Some(listener) = &self.listener {
                listener.on_upload(&UploadReport::from_result(UploadTrigger::Scheduled, &result));
            }
        }

        info!("upload scheduler stopped");
    }

    async fn refresh_if_due(&self) {
        if !self.fetcher.should_refresh() {
            return;
        }
        if let Err(e) = self.fetcher.fetch().await {
            warn!(error = %e, "remote config refresh failed, keeping current config");
        }
    }
}

/// Transient failures extend the streak; a skipped tick leaves it alone;
/// anything else resets it.
fn next_failure_count(current: u32, result: &Result<usize, UploadError>) -> u32 {
    match result {
        Err(UploadError::InFlight) => current,
        Err(e) if e.is_transient() => current.saturating_add(1),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfigSource, MockResponse, MockTransport, RecordingListener};
    use crate::network::AlwaysOnline;
    use crate::retry::DualRatePolicy;
    use crate::uploader::UploadSettings;
    use beacon_core::{
        BeaconConfig, DeviceContext, EventBuilder, EventContext, ManualClock, Properties,
        RemoteConfig, SessionId,
    };
    use beacon_store::{Database, EventQueue, KvRepo};
    use beacon_telemetry::MetricsRecorder;

    const INTERVAL_MS: u64 = 1_000;
    const BACKOFF_MS: u64 = 5_000;

    struct Harness {
        queue: EventQueue,
        transport: Arc<MockTransport>,
        source: Arc<MockConfigSource>,
        listener: Arc<RecordingListener>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(transport: MockTransport, source: MockConfigSource) -> Harness {
        let mut config = BeaconConfig::new("https://collector.test", "key");
        config.upload_interval_ms = INTERVAL_MS;

        let db = Database::in_memory().unwrap();
        let queue = EventQueue::new(db.clone());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let transport = Arc::new(transport);
        let source = Arc::new(source);
        let listener = Arc::new(RecordingListener::default());
        let cancel = CancellationToken::new();

        let fetcher = Arc::new(RemoteConfigFetcher::new(
            source.clone(),
            KvRepo::new(db),
            clock.clone(),
            RemoteConfig::from_local(&config),
        ));
        let coordinator = Arc::new(UploadCoordinator::new(
            queue.clone(),
            transport.clone(),
            Arc::new(AlwaysOnline),
            clock,
            Arc::new(MetricsRecorder::new()),
            UploadSettings::from_config(&config),
            fetcher.subscribe(),
        ));
        let scheduler = UploadScheduler::new(
            coordinator,
            fetcher,
            Box::new(DualRatePolicy {
                failure_backoff: Duration::from_millis(BACKOFF_MS),
            }),
            Some(listener.clone()),
            cancel.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        Harness {
            queue,
            transport,
            source,
            listener,
            cancel,
            handle,
        }
    }

    fn enqueue(h: &Harness, name: &str) {
        let event = EventBuilder::new(name)
            .build(EventContext {
                session_id: SessionId::from_raw("s"),
                user_id: None,
                device_context: DeviceContext::default(),
                user_properties: Properties::new(),
                now_ms: 1,
            })
            .unwrap();
        h.queue
            .enqueue(&serde_json::to_vec(&event).unwrap(), 1)
            .unwrap();
    }

    async fn advance_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval() {
        let h = start(MockTransport::accepting(), MockConfigSource::failing());
        enqueue(&h, "a");

        advance_ms(3_500).await;
        let reports = h.listener.reports();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].delivered, 1);
        assert!(reports.iter().all(|r| r.trigger == UploadTrigger::Scheduled));
        assert_eq!(h.transport.call_count(), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_after_transient_failure() {
        let h = start(
            MockTransport::new(vec![MockResponse::Fail("connection reset".into())]),
            MockConfigSource::failing(),
        );
        enqueue(&h, "a");

        // First tick at 1s fails; next tick waits the backoff, landing at 6s.
        advance_ms(5_500).await;
        assert_eq!(h.listener.len(), 1);
        assert_eq!(h.listener.reports()[0].error_kind, Some("transport"));

        advance_ms(1_000).await;
        let reports = h.listener.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].delivered, 1);

        // Streak reset: back to the normal interval.
        advance_ms(1_000).await;
        assert_eq!(h.listener.len(), 3);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn applies_remote_interval() {
        let remote = RemoteConfig {
            upload_interval_ms: 2_000,
            ..RemoteConfig::default()
        };
        let h = start(MockTransport::accepting(), MockConfigSource::serving(remote));

        advance_ms(3_500).await;
        assert_eq!(h.listener.len(), 1);
        assert_eq!(h.source.call_count(), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_before_next_tick() {
        let h = start(MockTransport::accepting(), MockConfigSource::failing());
        enqueue(&h, "a");

        h.cancel.cancel();
        h.handle.await.unwrap();
        assert!(h.listener.is_empty());
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_in_flight_upload_finish() {
        let h = start(
            MockTransport::new(vec![MockResponse::delayed(
                Duration::from_secs(5),
                MockResponse::Accept,
            )]),
            MockConfigSource::failing(),
        );
        enqueue(&h, "a");

        advance_ms(1_500).await;
        assert_eq!(h.transport.call_count(), 1);
        h.cancel.cancel();
        h.handle.await.unwrap();

        assert_eq!(h.listener.len(), 1);
        assert!(h.listener.reports()[0].is_success());
        assert_eq!(h.queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn failure_streak_rules() {
        assert_eq!(next_failure_count(2, &Ok(0)), 0);
        assert_eq!(next_failure_count(2, &Err(UploadError::NetworkUnavailable)), 3);
        assert_eq!(next_failure_count(2, &Err(UploadError::InFlight)), 2);
        assert_eq!(
            next_failure_count(2, &Err(UploadError::Rejected { message: "bad".into() })),
            0
        );
    }
}
