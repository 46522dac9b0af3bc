use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use beacon_core::RemoteConfig;

use crate::diagnostics::{DiagnosticsListener, UploadReport};
use crate::error::{FetchError, UploadError};
use crate::remote_config::ConfigSource;
use crate::transport::{OutgoingBatch, Transport};
use crate::wire::UploadResponse;

/// Pre-programmed transport outcomes for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Collector accepts the batch.
    Accept,
    /// Collector answers `success: false`.
    Reject(String),
    /// The request fails before a response arrives.
    Fail(String),
    /// Wait, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Transport that replays scripted responses in order, then falls back to
/// a default once the script runs out.
pub struct MockTransport {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sent: Mutex<Vec<serde_json::Value>>,
}

impl MockTransport {
    pub fn new(script: Vec<MockResponse>) -> Self {
        Self::with_fallback(script, MockResponse::Accept)
    }

    pub fn with_fallback(script: Vec<MockResponse>, fallback: MockResponse) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            call_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Accepts everything.
    pub fn accepting() -> Self {
        Self::new(Vec::new())
    }

    pub fn push(&self, response: MockResponse) {
        self.script.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `send` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Decoded request bodies, in send order.
    pub fn sent_bodies(&self) -> Vec<serde_json::Value> {
        self.sent.lock().clone()
    }

    /// Event names across every request, in send order.
    pub fn sent_event_names(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .flat_map(|body| body["events"].as_array().cloned().unwrap_or_default())
            .filter_map(|e| e["name"].as_str().map(str::to_owned))
            .collect()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, batch: &OutgoingBatch) -> Result<UploadResponse, UploadError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if let Ok(body) = serde_json::from_slice(&batch.body) {
            self.sent.lock().push(body);
        }

        let mut response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        loop {
            match response {
                MockResponse::Accept => {
                    return Ok(UploadResponse::accepted(batch.event_count as u64))
                }
                MockResponse::Reject(message) => return Ok(UploadResponse::rejected(message)),
                MockResponse::Fail(message) => return Err(UploadError::Transport(message)),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
            }
        }
    }
}

/// Config source that serves a fixed config, or fails with HTTP 503 when
/// none is set.
#[derive(Default)]
pub struct MockConfigSource {
    config: Mutex<Option<RemoteConfig>>,
    calls: AtomicUsize,
}

impl MockConfigSource {
    pub fn serving(config: RemoteConfig) -> Self {
        Self {
            config: Mutex::new(Some(config)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn set(&self, config: Option<RemoteConfig>) {
        *self.config.lock() = config;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for MockConfigSource {
    async fn fetch(&self) -> Result<RemoteConfig, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.config.lock().clone().ok_or(FetchError::Status(503))
    }
}

/// Collects every upload report.
#[derive(Default)]
pub struct RecordingListener {
    reports: Mutex<Vec<UploadReport>>,
}

impl RecordingListener {
    pub fn reports(&self) -> Vec<UploadReport> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl DiagnosticsListener for RecordingListener {
    fn on_upload(&self, report: &UploadReport) {
        self.reports.lock().push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::BatchId;

    fn batch() -> OutgoingBatch {
        OutgoingBatch {
            batch_id: BatchId::new(),
            body: br#"{"events":[{"name":"a"}]}"#.to_vec(),
            event_count: 1,
        }
    }

    #[tokio::test]
    async fn replays_script_then_fallback() {
        let t = MockTransport::new(vec![
            MockResponse::Fail("down".into()),
            MockResponse::Reject("nope".into()),
        ]);
        assert!(t.send(&batch()).await.is_err());
        assert!(!t.send(&batch()).await.unwrap().success);
        assert!(t.send(&batch()).await.unwrap().success);
        assert_eq!(t.call_count(), 3);
        assert_eq!(t.sent_event_names(), vec!["a", "a", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_wraps_inner() {
        let t = MockTransport::new(vec![MockResponse::delayed(
            Duration::from_secs(10),
            MockResponse::Accept,
        )]);
        let start = tokio::time::Instant::now();
        assert!(t.send(&batch()).await.unwrap().success);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(t.max_in_flight(), 1);
    }
}
