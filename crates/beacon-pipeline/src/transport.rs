use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Client;
use tracing::{debug, instrument, warn};

use beacon_core::{BatchId, BeaconConfig};

use crate::error::UploadError;
use crate::wire::UploadResponse;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ZSTD_LEVEL: i32 = 3;
/// Max bytes of an error body echoed into logs and errors.
const ERROR_BODY_LIMIT: usize = 512;

/// One serialized upload request, ready for the wire.
#[derive(Clone, Debug)]
pub struct OutgoingBatch {
    pub batch_id: BatchId,
    /// JSON-encoded `UploadRequest`.
    pub body: Vec<u8>,
    pub event_count: usize,
}

/// Delivers one batch. Implementations must not retry internally.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &OutgoingBatch) -> Result<UploadResponse, UploadError>;
}

type Compressor = fn(&[u8]) -> std::io::Result<Vec<u8>>;

fn zstd_compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::encode_all(body, ZSTD_LEVEL)
}

/// `POST {serverUrl}/events` over reqwest.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    app_key: String,
    compression: bool,
    compression_fallback: bool,
    compressor: Compressor,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(config: &BeaconConfig) -> Result<Self, UploadError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.upload_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| UploadError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/events", config.server_url.trim_end_matches('/')),
            app_key: config.app_key.clone(),
            compression: config.enable_compression,
            compression_fallback: config.compression_fallback,
            compressor: zstd_compress,
            timeout: config.upload_timeout(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[cfg(test)]
    fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    /// Returns the body to send and whether it is compressed.
    fn encode(&self, body: &[u8]) -> Result<(Vec<u8>, bool), UploadError> {
        if !self.compression {
            return Ok((body.to_vec(), false));
        }
        match (self.compressor)(body) {
            Ok(compressed) => {
                debug!(raw = body.len(), compressed = compressed.len(), "compressed batch");
                Ok((compressed, true))
            }
            Err(e) if self.compression_fallback => {
                warn!(error = %e, "compression failed, sending uncompressed");
                Ok((body.to_vec(), false))
            }
            Err(e) => Err(UploadError::Transport(format!("compression failed: {e}"))),
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> UploadError {
        if e.is_timeout() {
            UploadError::Timeout(self.timeout.unwrap_or_default())
        } else {
            UploadError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id, events = batch.event_count))]
    async fn send(&self, batch: &OutgoingBatch) -> Result<UploadResponse, UploadError> {
        let (body, compressed) = self.encode(&batch.body)?;

        let mut req = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.app_key)
            .header(CONTENT_TYPE, "application/json")
            .header("x-request-id", batch.batch_id.as_str());
        if compressed {
            req = req.header(CONTENT_ENCODING, "zstd");
        }

        let resp = req.body(body).send().await.map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(UploadError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        resp.json::<UploadResponse>()
            .await
            .map_err(|e| UploadError::Transport(format!("invalid response body: {e}")))
    }
}
