//! API request and response types

use crate::wire::ResponseDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status pushed by the backend for a job
#[derive(Debug, Deserialize)]
pub struct JobStatusRequest {
    /// Backend vocabulary, e.g. `queued`, `processing`, `done`
    pub status: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure message, shown to the user when the job failed
    #[serde(default)]
    pub error: Option<String>,
}

/// Response for accepted callbacks
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// Response for a session reset
#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub existed: bool,
}

/// Response with a user's drained notifications, oldest first
#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<ResponseDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable tag
    pub kind: &'static str,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, kind: &'static str) -> Self {
        Self {
            error: message.into(),
            kind,
        }
    }
}
