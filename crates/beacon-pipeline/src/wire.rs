use serde::{Deserialize, Serialize};

use beacon_core::Event;

/// Body of `POST {serverUrl}/events`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest<'a> {
    pub events: &'a [Event],
    pub app_key: &'a str,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub received_count: u64,
}

impl UploadResponse {
    pub fn accepted(received_count: u64) -> Self {
        Self {
            success: true,
            message: None,
            received_count,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            received_count: 0,
        }
    }
}
