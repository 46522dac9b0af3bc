use std::time::Duration;

use beacon_core::{ConfigError, CryptoError, EventError};
use beacon_store::StoreError;

/// Outcome of a failed upload attempt.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no network path available")]
    NetworkUnavailable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upload timed out after {0:?}")]
    Timeout(Duration),

    #[error("upload rejected by collector: {message}")]
    Rejected { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("another upload is already in flight")]
    InFlight,
}

impl UploadError {
    /// Attempt reached the wire and failed; the batch's retry counters move.
    pub fn penalizes_retry(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Worth trying again later on the failure backoff schedule.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable | Self::Transport(_) | Self::Timeout(_)
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "network_unavailable",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::InFlight => "in_flight",
        }
    }
}

/// Remote config fetch failed and no persisted fallback exists.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("config request failed: {0}")]
    Network(String),

    #[error("config endpoint returned HTTP {0}")]
    Status(u16),

    #[error("invalid config body: {0}")]
    InvalidBody(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("beacon is not running (state: {0})")]
    NotRunning(&'static str),

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("background task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_penalty_classification() {
        assert!(UploadError::Transport("502".into()).penalizes_retry());
        assert!(UploadError::Timeout(Duration::from_secs(1)).penalizes_retry());
        assert!(!UploadError::NetworkUnavailable.penalizes_retry());
        assert!(!UploadError::Rejected { message: "bad key".into() }.penalizes_retry());
        assert!(!UploadError::InFlight.penalizes_retry());
    }

    #[test]
    fn transient_classification() {
        assert!(UploadError::NetworkUnavailable.is_transient());
        assert!(UploadError::Transport("reset".into()).is_transient());
        assert!(!UploadError::Rejected { message: String::new() }.is_transient());
        assert!(!UploadError::Serialization("x".into()).is_transient());
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(UploadError::NetworkUnavailable.error_kind(), "network_unavailable");
        assert_eq!(UploadError::InFlight.error_kind(), "in_flight");
        assert_eq!(
            UploadError::Rejected { message: String::new() }.error_kind(),
            "rejected"
        );
    }

    #[test]
    fn store_error_converts() {
        let err: UploadError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, UploadError::Storage(_)));
        let err: BeaconError = StoreError::Io("disk".into()).into();
        assert!(err.to_string().contains("disk"));
    }
}
