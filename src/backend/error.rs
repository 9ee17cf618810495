//! Backend error types

use std::fmt;
use thiserror::Error;

/// Backend call failure with classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Error { code }, message)
    }

    /// Explicit failure without an HTTP status (bad payload, client setup)
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Error { code: 0 }, message)
    }
}

/// Error classification for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Call exceeded its deadline - retryable
    Timeout,
    /// Connection refused or unreachable - retryable
    Unavailable,
    /// Non-2xx or explicit failure; `code` is the HTTP status, 0 if none
    Error { code: u16 },
}

impl BackendErrorKind {
    pub fn is_retryable(self) -> bool {
        match self {
            Self::Timeout | Self::Unavailable => true,
            Self::Error { code } => code == 429 || code >= 500,
        }
    }

    /// Machine-readable tag for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "backend_timeout",
            Self::Unavailable => "backend_unavailable",
            Self::Error { .. } => "backend_error",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error { code } => write!(f, "backend_error({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Classify a non-success HTTP response
pub fn classify_status(status: u16, body: &str) -> BackendError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .or_else(|| v.get("error"))
                .and_then(|d| d.as_str().map(String::from))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        401 | 403 => BackendError::status(status, format!("Authentication failed: {detail}")),
        404 => BackendError::status(status, format!("Not found: {detail}")),
        502..=504 => BackendError::new(
            BackendErrorKind::Unavailable,
            format!("Backend unavailable (HTTP {status}): {detail}"),
        ),
        _ => BackendError::status(status, format!("HTTP {status}: {detail}")),
    }
}
