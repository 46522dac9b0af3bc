pub mod cipher;
pub mod clock;
pub mod config;
pub mod event;
pub mod ids;
pub mod remote;
pub mod session;

pub use cipher::{CryptoError, FieldCipher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BeaconConfig, ConfigError, RetryStrategy};
pub use event::{DeviceContext, Event, EventBuilder, EventContext, EventError, Properties};
pub use ids::{BatchId, SessionId};
pub use remote::RemoteConfig;
pub use session::Session;
