//! Job status lifecycle

use super::JobError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Given up on locally (cancelled or session expired); the backend may
    /// still finish it
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Map a backend status string. Unknown strings read as still running.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "waiting" => Self::Pending,
            "completed" | "complete" | "done" | "success" | "succeeded" => Self::Completed,
            "failed" | "error" | "cancelled" | "canceled" => Self::Failed,
            _ => Self::Running,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that a status change is allowed.
///
/// Status only moves forward: Pending, then Running (repeatable for progress
/// updates), then Completed or Failed. A fast backend may skip Running.
/// Anything not yet terminal can be Abandoned. Nothing leaves a terminal
/// status.
pub fn validate_transition(job_id: &str, from: JobStatus, to: JobStatus) -> Result<(), JobError> {
    use JobStatus::{Abandoned, Completed, Failed, Pending, Running};

    let valid = matches!(
        (from, to),
        (Pending | Running, Running | Completed | Failed | Abandoned)
    );

    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidTransition {
            job_id: job_id.to_string(),
            from,
            to,
        })
    }
}
