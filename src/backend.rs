//! Contract with the external search and indexing service
//!
//! The core only orchestrates: every operation here is a network call that
//! may time out, be refused, or fail explicitly.

mod error;
mod http;

pub use error::{classify_status, BackendError, BackendErrorKind};
pub use http::{BackendConfig, HttpBackendClient};

use crate::jobs::JobStatus;
use crate::wire::FileRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Indexed document this citation points into, when it has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl SearchResponse {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty() && self.answer.as_deref().map_or(true, |a| a.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub document_id: String,
    /// Absent when the backend indexed synchronously
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConnection {
    pub connection_id: String,
    #[serde(default)]
    pub oauth_url: Option<String>,
    /// Initial sync started by the backend, if any
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: String,
}

/// A data source connected for the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub platform: Option<String>,
    /// `active`, `error`, or anything else the backend reports
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub document_count: u64,
}

impl SourceInfo {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }
}

/// What a fetch from a source brought in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub item_count: u64,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub sync_status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Fold a top-level `error` message into the job result, keeping any
/// `error` the result already carries.
pub fn with_error(result: Option<Value>, error: Option<String>) -> Option<Value> {
    let Some(error) = error.filter(|e| !e.trim().is_empty()) else {
        return result;
    };
    match result {
        Some(Value::Object(mut fields)) => {
            fields.entry("error").or_insert(Value::String(error));
            Some(Value::Object(fields))
        }
        Some(other) => Some(json!({ "error": error, "value": other })),
        None => Some(json!({ "error": error })),
    }
}

/// Names of backend operations, for logs and failure replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOperation {
    Search,
    Upload,
    FetchJobStatus,
    ConnectPlatform,
    ProcessDocument,
    SyncSource,
    GetSources,
    FetchDocuments,
}

impl BackendOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Upload => "upload",
            Self::FetchJobStatus => "fetch_job_status",
            Self::ConnectPlatform => "connect_platform",
            Self::ProcessDocument => "process_document",
            Self::SyncSource => "sync_source",
            Self::GetSources => "get_sources",
            Self::FetchDocuments => "fetch_documents",
        }
    }
}

impl fmt::Display for BackendOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn search(&self, user_id: &str, query: &str) -> Result<SearchResponse, BackendError>;

    async fn upload(
        &self,
        user_id: &str,
        file: &FileRef,
        metadata: &Value,
    ) -> Result<UploadReceipt, BackendError>;

    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusReport, BackendError>;

    async fn connect_platform(
        &self,
        user_id: &str,
        platform: &str,
        params: &Value,
    ) -> Result<PlatformConnection, BackendError>;

    async fn process_document(&self, user_id: &str, document_id: &str) -> Result<JobReceipt, BackendError>;

    async fn sync_source(&self, user_id: &str, source: &str) -> Result<JobReceipt, BackendError>;

    async fn get_sources(&self, user_id: &str) -> Result<Vec<SourceInfo>, BackendError>;

    async fn fetch_documents(&self, user_id: &str, source: &str) -> Result<FetchSummary, BackendError>;
}

#[async_trait]
impl<T: BackendClient + ?Sized> BackendClient for Arc<T> {
    async fn search(&self, user_id: &str, query: &str) -> Result<SearchResponse, BackendError> {
        (**self).search(user_id, query).await
    }

    async fn upload(
        &self,
        user_id: &str,
        file: &FileRef,
        metadata: &Value,
    ) -> Result<UploadReceipt, BackendError> {
        (**self).upload(user_id, file, metadata).await
    }

    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusReport, BackendError> {
        (**self).fetch_job_status(job_id).await
    }

    async fn connect_platform(
        &self,
        user_id: &str,
        platform: &str,
        params: &Value,
    ) -> Result<PlatformConnection, BackendError> {
        (**self).connect_platform(user_id, platform, params).await
    }

    async fn process_document(&self, user_id: &str, document_id: &str) -> Result<JobReceipt, BackendError> {
        (**self).process_document(user_id, document_id).await
    }

    async fn sync_source(&self, user_id: &str, source: &str) -> Result<JobReceipt, BackendError> {
        (**self).sync_source(user_id, source).await
    }

    async fn get_sources(&self, user_id: &str) -> Result<Vec<SourceInfo>, BackendError> {
        (**self).get_sources(user_id).await
    }

    async fn fetch_documents(&self, user_id: &str, source: &str) -> Result<FetchSummary, BackendError> {
        (**self).fetch_documents(user_id, source).await
    }
}
