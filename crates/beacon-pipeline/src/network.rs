use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

/// Host-provided connectivity signal.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_available(&self) -> bool;
}

/// Assumes a network path always exists; the transport reports real failures.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl NetworkMonitor for AlwaysOnline {
    async fn is_available(&self) -> bool {
        true
    }
}

/// Connectivity flag flipped by the host.
#[derive(Debug)]
pub struct StaticNetwork {
    online: AtomicBool,
}

impl StaticNetwork {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkMonitor for StaticNetwork {
    async fn is_available(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_network_toggles() {
        let net = StaticNetwork::new(false);
        assert!(!net.is_available().await);
        net.set_online(true);
        assert!(net.is_available().await);
        assert!(AlwaysOnline.is_available().await);
    }
}
