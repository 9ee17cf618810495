//! Conversation state types

use serde::{Deserialize, Serialize};

use crate::backend::Citation;

/// What an expected upload is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadPurpose {
    /// Add to the user's searchable index
    Index,
    /// Supplement to an existing job
    AttachToJob { job_id: String },
}

/// A document offered for selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCandidate {
    pub document_id: String,
    pub title: String,
}

/// Step of the multi-message flow the user is in. Exactly one per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationState {
    /// No pending multi-step flow
    #[default]
    Idle,

    /// The next file is bound to `purpose`
    AwaitingFileUpload { purpose: UploadPurpose },

    /// The next choice must be one of `candidates`
    AwaitingPlatformChoice { candidates: Vec<String> },

    /// Follow-up text refines `last_query`
    AwaitingSearchRefinement {
        last_query: String,
        last_citations: Vec<Citation>,
    },

    /// The next selection indexes into `candidates`; `page` is zero-based
    AwaitingDocumentSelection {
        candidates: Vec<DocumentCandidate>,
        page: usize,
    },
}

impl ConversationState {
    pub fn name(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::AwaitingFileUpload { .. } => "awaiting_file_upload",
            ConversationState::AwaitingPlatformChoice { .. } => "awaiting_platform_choice",
            ConversationState::AwaitingSearchRefinement { .. } => "awaiting_search_refinement",
            ConversationState::AwaitingDocumentSelection { .. } => "awaiting_document_selection",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConversationState::Idle)
    }
}
