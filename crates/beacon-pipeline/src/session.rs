use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use beacon_core::{Clock, Session, SessionId};

/// Rotating session cursor. Reads and rotation happen under one lock.
#[derive(Debug)]
pub struct SessionTracker {
    timeout_ms: i64,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<Session>>,
}

impl SessionTracker {
    pub fn new(timeout_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout_ms: i64::try_from(timeout_ms).unwrap_or(i64::MAX),
            clock,
            current: Mutex::new(None),
        }
    }

    /// Reuse the active session unless it has been idle past the timeout,
    /// then record activity.
    pub fn current_session_id(&self) -> SessionId {
        let now = self.clock.now_ms();
        let mut guard = self.current.lock();
        match guard.as_mut() {
            Some(session) if !session.is_expired(now, self.timeout_ms) => {
                session.last_activity_at = now;
                session.session_id.clone()
            }
            _ => {
                let session = Session::start(now);
                debug!(session_id = %session.session_id, "starting new session");
                let id = session.session_id.clone();
                *guard = Some(session);
                id
            }
        }
    }

    /// Active session without recording activity.
    pub fn peek(&self) -> Option<Session> {
        self.current.lock().clone()
    }

    /// Force a new session on next access.
    pub fn reset(&self) {
        *self.current.lock() = None;
    }
}
