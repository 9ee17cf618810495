//! Effects produced by state transitions

use super::UploadPurpose;
use crate::jobs::JobKind;
use crate::wire::{FileRef, ResponseDescriptor};

/// What a source listing is shown for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceListing {
    /// Every connected source with its sync details
    Overview,
    /// Active sources to pick one to fetch from
    FetchPicker,
}

/// Effects to be executed after a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Say something to the user
    Reply(ResponseDescriptor),

    /// Call the backend search
    Search { query: String },

    /// Hand a file to the backend
    Upload { file: FileRef, purpose: UploadPurpose },

    /// Start connecting a data source
    ConnectPlatform { platform: String },

    /// Start processing an indexed document
    ProcessDocument { document_id: String, title: String },

    /// Start syncing a connected source
    SyncSource { source: String },

    /// Ask the backend for the user's connected sources
    ListSources { listing: SourceListing },

    /// Pull the latest documents from a connected source
    FetchDocuments { source: String },

    /// Track a backend job for the current user
    RegisterJob {
        job_id: String,
        kind: JobKind,
        label: String,
    },

    /// Mark jobs Abandoned locally
    AbandonJobs { job_ids: Vec<String> },

    /// Report one job, or the user's outstanding jobs when `None`
    ReportJobStatus { job_id: Option<String> },

    /// Session and job counts (admin)
    ReportStats,

    /// Show the allow-list (admin)
    ListUsers,

    /// Add a user to the allow-list (admin)
    GrantAccess { user_id: String },

    /// Remove a user from the allow-list (admin)
    RevokeAccess { user_id: String },
}

impl Effect {
    /// Whether running this effect calls the backend
    pub fn is_backend_call(&self) -> bool {
        matches!(
            self,
            Effect::Search { .. }
                | Effect::Upload { .. }
                | Effect::ConnectPlatform { .. }
                | Effect::ProcessDocument { .. }
                | Effect::SyncSource { .. }
                | Effect::ListSources { .. }
                | Effect::FetchDocuments { .. }
        )
    }
}
