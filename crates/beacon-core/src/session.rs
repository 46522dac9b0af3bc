use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// The single active session cursor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub last_activity_at: i64,
}

impl Session {
    pub fn start(now_ms: i64) -> Self {
        Self {
            session_id: SessionId::generate(now_ms),
            last_activity_at: now_ms,
        }
    }

    /// Reusable only while `now - last_activity_at <= timeout`.
    pub fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_activity_at) > timeout_ms
    }
}
