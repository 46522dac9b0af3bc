//! Delivery side of beacon: sessions, field encryption, transport, retry
//! policies, the upload coordinator and loop, remote config, and the
//! [`Beacon`] handle that ties them together.

pub mod beacon;
pub mod diagnostics;
pub mod error;
pub mod hooks;
pub mod mock;
pub mod network;
pub mod processor;
pub mod remote_config;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod uploader;
pub mod wire;

pub use beacon::{Beacon, BeaconDeps, LifecycleState};
pub use diagnostics::{DiagnosticsListener, UploadReport, UploadTrigger};
pub use error::{BeaconError, FetchError, UploadError};
pub use hooks::InstrumentationHooks;
pub use network::{AlwaysOnline, NetworkMonitor, StaticNetwork};
pub use processor::{CryptoErrorReporter, EventProcessor};
pub use remote_config::{ConfigSource, HttpConfigSource, RemoteConfigFetcher};
pub use retry::{policy_for, DualRatePolicy, ExponentialBackoffPolicy, RetryPolicy};
pub use session::SessionTracker;
pub use transport::{HttpTransport, OutgoingBatch, Transport};
pub use uploader::{UploadCoordinator, UploadSettings};
pub use wire::{UploadRequest, UploadResponse};
