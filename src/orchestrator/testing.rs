//! Mock implementations for testing
//!
//! These mocks enable end-to-end orchestration tests without a network or
//! database, with time driven by a `ManualClock`.

use super::Orchestrator;
use crate::backend::{
    BackendClient, BackendError, FetchSummary, JobReceipt, JobStatusReport, PlatformConnection, SearchResponse,
    SourceInfo, UploadReceipt,
};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::notify::Outbox;
use crate::session::{Role, UserSession};
use crate::store::{KvStore, MemoryStore, StoreError, StoreResult};
use crate::wire::{FileRef, InboundBody, InboundEvent, ResponseDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock Backend Client
// ============================================================================

/// A call the core made to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Search { user_id: String, query: String },
    Upload { user_id: String, file_name: String, metadata: Value },
    FetchJobStatus { job_id: String },
    ConnectPlatform { user_id: String, platform: String },
    ProcessDocument { user_id: String, document_id: String },
    SyncSource { user_id: String, source: String },
    GetSources { user_id: String },
    FetchDocuments { user_id: String, source: String },
}

type Queue<T> = Mutex<VecDeque<Result<T, BackendError>>>;

/// Backend that returns queued responses and records every call.
/// An operation with nothing queued fails as unavailable.
#[derive(Default)]
pub struct MockBackendClient {
    searches: Queue<SearchResponse>,
    uploads: Queue<UploadReceipt>,
    connections: Queue<PlatformConnection>,
    receipts: Queue<JobReceipt>,
    sources: Queue<Vec<SourceInfo>>,
    fetches: Queue<FetchSummary>,
    statuses: Mutex<HashMap<String, VecDeque<Result<JobStatusReport, BackendError>>>>,
    calls: Mutex<Vec<BackendCall>>,
}

impl MockBackendClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_search(&self, response: Result<SearchResponse, BackendError>) {
        self.searches.lock().unwrap().push_back(response);
    }

    pub fn queue_upload(&self, receipt: Result<UploadReceipt, BackendError>) {
        self.uploads.lock().unwrap().push_back(receipt);
    }

    pub fn queue_connection(&self, connection: Result<PlatformConnection, BackendError>) {
        self.connections.lock().unwrap().push_back(connection);
    }

    /// Shared by `process_document` and `sync_source`
    pub fn queue_receipt(&self, receipt: Result<JobReceipt, BackendError>) {
        self.receipts.lock().unwrap().push_back(receipt);
    }

    pub fn queue_sources(&self, sources: Result<Vec<SourceInfo>, BackendError>) {
        self.sources.lock().unwrap().push_back(sources);
    }

    pub fn queue_fetch(&self, summary: Result<FetchSummary, BackendError>) {
        self.fetches.lock().unwrap().push_back(summary);
    }

    pub fn queue_status(&self, job_id: &str, report: Result<JobStatusReport, BackendError>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .push_back(report);
    }

    pub fn recorded_calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn searches(&self) -> Vec<String> {
        self.recorded_calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Search { query, .. } => Some(query),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next<T>(queue: &Queue<T>) -> Result<T, BackendError> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::unavailable("No mock response queued")))
    }
}

#[async_trait]
impl BackendClient for MockBackendClient {
    async fn search(&self, user_id: &str, query: &str) -> Result<SearchResponse, BackendError> {
        self.record(BackendCall::Search {
            user_id: user_id.to_string(),
            query: query.to_string(),
        });
        Self::next(&self.searches)
    }

    async fn upload(
        &self,
        user_id: &str,
        file: &FileRef,
        metadata: &Value,
    ) -> Result<UploadReceipt, BackendError> {
        self.record(BackendCall::Upload {
            user_id: user_id.to_string(),
            file_name: file.file_name.clone(),
            metadata: metadata.clone(),
        });
        Self::next(&self.uploads)
    }

    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusReport, BackendError> {
        self.record(BackendCall::FetchJobStatus {
            job_id: job_id.to_string(),
        });
        self.statuses
            .lock()
            .unwrap()
            .get_mut(job_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(BackendError::unavailable("No mock status queued")))
    }

    async fn connect_platform(
        &self,
        user_id: &str,
        platform: &str,
        _params: &Value,
    ) -> Result<PlatformConnection, BackendError> {
        self.record(BackendCall::ConnectPlatform {
            user_id: user_id.to_string(),
            platform: platform.to_string(),
        });
        Self::next(&self.connections)
    }

    async fn process_document(&self, user_id: &str, document_id: &str) -> Result<JobReceipt, BackendError> {
        self.record(BackendCall::ProcessDocument {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
        });
        Self::next(&self.receipts)
    }

    async fn sync_source(&self, user_id: &str, source: &str) -> Result<JobReceipt, BackendError> {
        self.record(BackendCall::SyncSource {
            user_id: user_id.to_string(),
            source: source.to_string(),
        });
        Self::next(&self.receipts)
    }

    async fn get_sources(&self, user_id: &str) -> Result<Vec<SourceInfo>, BackendError> {
        self.record(BackendCall::GetSources {
            user_id: user_id.to_string(),
        });
        Self::next(&self.sources)
    }

    async fn fetch_documents(&self, user_id: &str, source: &str) -> Result<FetchSummary, BackendError> {
        self.record(BackendCall::FetchDocuments {
            user_id: user_id.to_string(),
            source: source.to_string(),
        });
        Self::next(&self.fetches)
    }
}

// ============================================================================
// Delayed Backend Client
// ============================================================================

/// Backend that answers like `inner`, but only after `delay`
pub struct DelayedBackendClient {
    inner: Arc<MockBackendClient>,
    delay: Duration,
}

impl DelayedBackendClient {
    pub fn new(inner: Arc<MockBackendClient>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl BackendClient for DelayedBackendClient {
    async fn search(&self, user_id: &str, query: &str) -> Result<SearchResponse, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.search(user_id, query).await
    }

    async fn upload(
        &self,
        user_id: &str,
        file: &FileRef,
        metadata: &Value,
    ) -> Result<UploadReceipt, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upload(user_id, file, metadata).await
    }

    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusReport, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_job_status(job_id).await
    }

    async fn connect_platform(
        &self,
        user_id: &str,
        platform: &str,
        params: &Value,
    ) -> Result<PlatformConnection, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect_platform(user_id, platform, params).await
    }

    async fn process_document(&self, user_id: &str, document_id: &str) -> Result<JobReceipt, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.process_document(user_id, document_id).await
    }

    async fn sync_source(&self, user_id: &str, source: &str) -> Result<JobReceipt, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.sync_source(user_id, source).await
    }

    async fn get_sources(&self, user_id: &str) -> Result<Vec<SourceInfo>, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_sources(user_id).await
    }

    async fn fetch_documents(&self, user_id: &str, source: &str) -> Result<FetchSummary, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_documents(user_id, source).await
    }
}

// ============================================================================
// Failing Store
// ============================================================================

/// Backing store that is always down
pub struct FailingStore;

impl FailingStore {
    fn down<T>() -> StoreResult<T> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl KvStore for FailingStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        Self::down()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        Self::down()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        Self::down()
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Self::down()
    }

    async fn scan(&self, _prefix: &str) -> StoreResult<Vec<(String, String)>> {
        Self::down()
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        Self::down()
    }
}

// ============================================================================
// Test Harness
// ============================================================================

/// An orchestrator wired to mocks, with handles on each of them
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MockBackendClient>,
    pub outbox: Arc<Outbox>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let backend = Arc::new(MockBackendClient::new());
        let outbox = Arc::new(Outbox::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            store.clone(),
            backend.clone(),
            outbox.clone(),
            clock.clone(),
        ));
        Self {
            clock,
            store,
            backend,
            outbox,
            orchestrator,
        }
    }

    pub async fn send(&self, user_id: &str, body: InboundBody) -> ResponseDescriptor {
        self.orchestrator
            .handle(InboundEvent::new(user_id, body))
            .await
            .unwrap()
    }

    /// Send text (commands included) and return the reply text
    pub async fn say(&self, user_id: &str, text: &str) -> String {
        self.send(user_id, InboundBody::Text(text.to_string()))
            .await
            .reply_text
    }

    pub async fn session(&self, user_id: &str) -> UserSession {
        self.orchestrator
            .sessions()
            .get_or_create(user_id, Role::User)
            .await
            .unwrap()
    }

    pub fn notifications(&self, user_id: &str) -> Vec<String> {
        self.outbox
            .drain(user_id)
            .into_iter()
            .map(|message| message.reply_text)
            .collect()
    }
}

pub fn file(name: &str) -> FileRef {
    FileRef {
        file_name: name.to_string(),
        size_bytes: 120 * 1024,
        mime_type: None,
        location: format!("https://files.example/{name}"),
    }
}

// ============================================================================
// Scenario Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessPolicy;
    use crate::backend::{BackendErrorKind, Citation};
    use crate::error::CoreError;
    use crate::jobs::{JobKind, JobStatus};
    use crate::rate_limit::{CommandClass, RateLimit};
    use crate::state_machine::{ConversationState, UploadPurpose};
    use serde_json::json;
    use std::collections::HashSet;

    const POLL: Duration = Duration::from_secs(5);

    fn citation(id: &str, document_id: &str) -> Citation {
        Citation {
            id: id.to_string(),
            title: format!("Report {id}"),
            url: Some(format!("https://docs.example/{id}")),
            source: Some("drive".to_string()),
            snippet: Some("Revenue grew 12% quarter over quarter".to_string()),
            document_id: Some(document_id.to_string()),
        }
    }

    fn results() -> SearchResponse {
        SearchResponse {
            answer: Some("Revenue grew 12%.".to_string()),
            citations: vec![citation("1", "doc-1"), citation("2", "doc-2")],
        }
    }

    fn report(status: JobStatus) -> JobStatusReport {
        JobStatusReport {
            status,
            progress: if status == JobStatus::Completed { 100 } else { 40 },
            result: None,
        }
    }

    /// Start `/sync drive` while choosing a platform, so job `job_id`
    /// belongs to the unfinished connect flow
    async fn sync_mid_connect(h: &Harness, user_id: &str, job_id: &str) {
        h.say(user_id, "/connect").await;
        h.backend.queue_receipt(Ok(JobReceipt {
            job_id: job_id.to_string(),
        }));
        h.say(user_id, "/sync drive").await;
    }

    fn source(id: &str, status: &str) -> SourceInfo {
        SourceInfo {
            id: id.to_string(),
            name: format!("Source {id}"),
            platform: Some("drive".to_string()),
            status: Some(status.to_string()),
            last_sync: None,
            document_count: 4,
        }
    }

    /// Upload `doc.pdf` for `user_id`, leaving job `job_id` registered
    async fn upload(h: &Harness, user_id: &str, job_id: &str) {
        h.say(user_id, "/upload").await;
        h.backend.queue_upload(Ok(UploadReceipt {
            document_id: "doc-1".to_string(),
            job_id: Some(job_id.to_string()),
        }));
        h.send(user_id, InboundBody::File(file("doc.pdf"))).await;
    }

    #[tokio::test]
    async fn test_upload_flow_notifies_once() {
        let h = Harness::new();

        h.say("u1", "/upload").await;
        assert_eq!(
            h.session("u1").await.state,
            ConversationState::AwaitingFileUpload {
                purpose: UploadPurpose::Index
            }
        );

        h.backend.queue_upload(Ok(UploadReceipt {
            document_id: "doc-1".to_string(),
            job_id: Some("job-1".to_string()),
        }));
        let reply = h.send("u1", InboundBody::File(file("doc.pdf"))).await;
        assert!(reply.reply_text.contains("job-1"));

        // the upload flow is over, so the job no longer belongs to it
        let session = h.session("u1").await;
        assert_eq!(session.state, ConversationState::Idle);
        assert!(session.state_context.flow_jobs.is_empty());
        let job = h.orchestrator.jobs().get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, JobKind::Upload);

        // not due yet
        assert_eq!(h.orchestrator.sweep().await, 0);

        h.backend.queue_status("job-1", Ok(report(JobStatus::Running)));
        h.clock.advance(POLL);
        assert_eq!(h.orchestrator.sweep().await, 1);
        assert!(h.notifications("u1").is_empty());

        h.backend.queue_status("job-1", Ok(report(JobStatus::Completed)));
        h.clock.advance(POLL);
        assert_eq!(h.orchestrator.sweep().await, 1);

        assert_eq!(h.notifications("u1"), vec!["✅ doc.pdf indexed.".to_string()]);
        let job = h.orchestrator.jobs().get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(h.session("u1").await.state_context.flow_jobs.is_empty());

        // settled jobs are not polled again, and a late push changes nothing
        h.clock.advance(Duration::from_secs(600));
        assert_eq!(h.orchestrator.sweep().await, 0);
        h.orchestrator
            .job_callback("job-1", JobStatus::Completed, 100, None)
            .await
            .unwrap();
        assert!(h.notifications("u1").is_empty());
    }

    #[tokio::test]
    async fn test_upload_metadata_names_purpose() {
        let h = Harness::new();
        h.say("u1", "/attach parent-7").await;
        h.backend.queue_upload(Ok(UploadReceipt {
            document_id: "doc-9".to_string(),
            job_id: None,
        }));
        let reply = h.send("u1", InboundBody::File(file("extra.csv"))).await;
        assert!(reply.reply_text.contains("extra.csv"));

        let calls = h.backend.recorded_calls();
        let BackendCall::Upload { metadata, .. } = &calls[0] else {
            panic!("expected an upload, got {calls:?}");
        };
        assert_eq!(metadata["purpose"], json!("attach"));
        assert_eq!(metadata["parent_job_id"], json!("parent-7"));
        assert_eq!(metadata["content_type"], json!("text/csv"));
    }

    #[tokio::test]
    async fn test_cancel_mid_flow_silences_later_completion() {
        let h = Harness::new();
        sync_mid_connect(&h, "u1", "sync-1").await;

        let session = h.session("u1").await;
        assert!(matches!(session.state, ConversationState::AwaitingPlatformChoice { .. }));
        assert_eq!(session.state_context.flow_jobs, vec!["sync-1".to_string()]);

        let reply = h.say("u1", "/cancel").await;
        assert!(reply.contains("1 background job"));
        let session = h.session("u1").await;
        assert_eq!(session.state, ConversationState::Idle);
        assert!(session.state_context.flow_jobs.is_empty());

        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);

        h.orchestrator
            .job_callback("sync-1", JobStatus::Completed, 100, Some(json!({ "items": 12 })))
            .await
            .unwrap();
        assert!(h.notifications("u1").is_empty());
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);
        assert_eq!(job.remote_status, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancel_while_idle_keeps_finished_flow_jobs() {
        let h = Harness::new();
        upload(&h, "u1", "job-1").await;

        assert!(h.say("u1", "/cancel").await.contains("nothing to cancel"));
        let job = h.orchestrator.jobs().get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        h.orchestrator
            .job_callback("job-1", JobStatus::Completed, 100, None)
            .await
            .unwrap();
        assert_eq!(h.notifications("u1"), vec!["✅ doc.pdf indexed.".to_string()]);
    }

    #[tokio::test]
    async fn test_refinement_merges_query() {
        let h = Harness::new();
        h.backend.queue_search(Ok(results()));
        let reply = h.say("u1", "revenue growth").await;
        assert!(reply.contains("Found 2 results"));

        let ConversationState::AwaitingSearchRefinement { last_query, last_citations } = h.session("u1").await.state
        else {
            panic!("expected refinement state");
        };
        assert_eq!(last_query, "revenue growth");
        assert_eq!(last_citations.len(), 2);

        h.backend.queue_search(Ok(results()));
        h.say("u1", "in Q2 only").await;
        assert_eq!(h.backend.searches(), vec!["revenue growth", "revenue growth in Q2 only"]);

        let session = h.session("u1").await;
        assert_eq!(
            session.state_context.search_history,
            vec!["revenue growth in Q2 only".to_string(), "revenue growth".to_string()]
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_unknown_outcome() {
        let h = Harness::new();
        upload(&h, "u1", "job-1").await;

        // nothing queued: every poll fails as unavailable
        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(300));
            assert_eq!(h.orchestrator.sweep().await, 1);
        }

        let job = h.orchestrator.jobs().get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.outcome_unknown);

        let notes = h.notifications("u1");
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("couldn't confirm"));

        h.clock.advance(Duration::from_secs(300));
        assert_eq!(h.orchestrator.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_poll_failures_back_off() {
        let h = Harness::new();
        upload(&h, "u1", "job-1").await;

        h.clock.advance(POLL);
        assert_eq!(h.orchestrator.sweep().await, 1);

        // one failure: next poll in 10s, not 5s
        h.clock.advance(POLL);
        assert_eq!(h.orchestrator.sweep().await, 0);
        h.clock.advance(POLL);
        h.backend.queue_status("job-1", Ok(report(JobStatus::Running)));
        assert_eq!(h.orchestrator.sweep().await, 1);

        let job = h.orchestrator.jobs().get("job-1").await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_expired_session_abandons_flow() {
        let h = Harness::new();
        sync_mid_connect(&h, "u1", "sync-1").await;

        h.clock.advance(Duration::from_secs(31 * 60));
        let reply = h.say("u1", "hello").await;
        assert!(reply.contains("timed out while awaiting platform choice"), "{reply}");
        assert!(reply.contains("1 background job"));

        let session = h.session("u1").await;
        assert_eq!(session.state, ConversationState::Idle);
        assert!(session.state_context.flow_jobs.is_empty());
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_settlement_after_expiry_is_not_delivered() {
        let h = Harness::new();
        sync_mid_connect(&h, "u1", "sync-1").await;

        h.clock.advance(Duration::from_secs(31 * 60));
        h.backend.queue_status("sync-1", Ok(report(JobStatus::Completed)));
        assert_eq!(h.orchestrator.sweep().await, 1);

        let notes = h.notifications("u1");
        assert!(notes.iter().any(|n| n.contains("timed out")), "{notes:?}");
        assert!(notes.iter().all(|n| !n.contains("finished")), "{notes:?}");
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);
        assert_eq!(job.remote_status, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_idle_session_expiry_still_delivers_completion() {
        let h = Harness::new();
        upload(&h, "u1", "job-1").await;

        h.clock.advance(Duration::from_secs(31 * 60));
        h.backend.queue_status("job-1", Ok(report(JobStatus::Completed)));
        assert_eq!(h.orchestrator.sweep().await, 1);

        assert_eq!(h.notifications("u1"), vec!["✅ doc.pdf indexed.".to_string()]);
        let job = h.orchestrator.jobs().get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_progress_polls_observe_expiry() {
        let h = Harness::new();
        sync_mid_connect(&h, "u1", "sync-1").await;

        // the job keeps running well past the session and its stored record
        for _ in 0..20 {
            h.backend.queue_status("sync-1", Ok(report(JobStatus::Running)));
            h.clock.advance(Duration::from_secs(300));
            h.orchestrator.sweep().await;
        }
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);

        h.orchestrator
            .job_callback("sync-1", JobStatus::Completed, 100, None)
            .await
            .unwrap();

        let notes = h.notifications("u1");
        assert!(notes.iter().any(|n| n.contains("timed out")), "{notes:?}");
        assert!(notes.iter().all(|n| !n.contains("finished")), "{notes:?}");
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.remote_status, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_pushed_progress_observes_expiry() {
        let h = Harness::new();
        sync_mid_connect(&h, "u1", "sync-1").await;

        h.clock.advance(Duration::from_secs(31 * 60));
        h.orchestrator
            .job_callback("sync-1", JobStatus::Running, 50, None)
            .await
            .unwrap();

        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);
        assert!(h.notifications("u1").iter().any(|n| n.contains("timed out")));
    }

    #[tokio::test]
    async fn test_completion_does_not_disturb_active_flow() {
        let h = Harness::new();
        upload(&h, "u1", "job-1").await;
        h.say("u1", "/connect").await;

        h.orchestrator
            .job_callback("job-1", JobStatus::Completed, 100, None)
            .await
            .unwrap();

        assert_eq!(h.notifications("u1").len(), 1);
        assert!(matches!(
            h.session("u1").await.state,
            ConversationState::AwaitingPlatformChoice { .. }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_without_calling_backend() {
        let mut config = Config::default();
        config.rate_limits.insert(CommandClass::Search, RateLimit::new(2, 60));
        let h = Harness::with_config(&config);

        for _ in 0..2 {
            h.backend.queue_search(Ok(SearchResponse::default()));
            h.say("u1", "quarterly numbers").await;
        }
        let reply = h.say("u1", "quarterly numbers").await;
        assert!(reply.contains("too quickly"));
        assert_eq!(h.backend.searches().len(), 2);

        // other users and other classes are unaffected
        h.backend.queue_search(Ok(SearchResponse::default()));
        h.say("u2", "quarterly numbers").await;
        assert!(h.say("u1", "/help").await.contains("Commands"));

        h.clock.advance(Duration::from_secs(60));
        h.backend.queue_search(Ok(SearchResponse::default()));
        assert!(!h.say("u1", "quarterly numbers").await.contains("too quickly"));
    }

    #[tokio::test]
    async fn test_unauthorized_user_gets_no_session() {
        let mut config = Config::default();
        config.access = AccessPolicy::new(HashSet::from(["alice".to_string()]), HashSet::new());
        let h = Harness::with_config(&config);

        let reply = h.say("mallory", "/upload").await;
        assert!(reply.contains("not authorized"));
        assert!(h.store.get("session:mallory").await.unwrap().is_none());

        h.say("alice", "/upload").await;
        assert!(h.store.get("session:alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_request() {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = Orchestrator::new(
            &Config::default(),
            Arc::new(FailingStore),
            Arc::new(MockBackendClient::new()),
            Arc::new(Outbox::new()),
            clock,
        );
        let result = orchestrator
            .handle(InboundEvent::new("u1", InboundBody::Text("/upload".to_string())))
            .await;
        assert!(matches!(result, Err(CoreError::SessionStoreUnavailable(_))));
        assert_eq!(orchestrator.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_backend_timeout_keeps_state() {
        let mut config = Config::default();
        config.backend.timeout = Duration::from_millis(20);
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let mock = Arc::new(MockBackendClient::new());
        mock.queue_search(Ok(results()));
        let orchestrator = Orchestrator::new(
            &config,
            store,
            Arc::new(DelayedBackendClient::new(mock, Duration::from_secs(5))),
            Arc::new(Outbox::new()),
            clock,
        );

        let reply = orchestrator
            .handle(InboundEvent::new("u1", InboundBody::Text("revenue growth".to_string())))
            .await
            .unwrap();
        assert!(reply.reply_text.contains("took too long"));

        let session = orchestrator.sessions().get_or_create("u1", Role::User).await.unwrap();
        assert_eq!(session.state, ConversationState::Idle);
        assert!(session.state_context.search_history.is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_reply_and_retry() {
        let h = Harness::new();
        h.say("u1", "/connect").await;
        h.backend.queue_connection(Err(BackendError::new(
            BackendErrorKind::Error { code: 500 },
            "boom",
        )));
        let reply = h.say("u1", "slack").await;
        assert!(reply.contains("reported an error"));
        assert!(matches!(
            h.session("u1").await.state,
            ConversationState::AwaitingPlatformChoice { .. }
        ));

        h.backend.queue_connection(Ok(PlatformConnection {
            connection_id: "conn-1".to_string(),
            oauth_url: Some("https://auth.example/slack".to_string()),
            job_id: Some("sync-1".to_string()),
        }));
        let reply = h.send("u1", InboundBody::Callback("choice:slack".to_string())).await;
        assert_eq!(reply.attachments.len(), 1);
        assert_eq!(h.session("u1").await.state, ConversationState::Idle);
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::Sync);
        assert_eq!(job.label, "slack sync");
    }

    #[tokio::test]
    async fn test_document_selection_starts_processing() {
        let h = Harness::new();
        h.backend.queue_search(Ok(results()));
        h.say("u1", "quarterly report").await;

        let listing = h.say("u1", "/documents").await;
        assert!(listing.contains("Report 2"));

        h.backend.queue_receipt(Ok(JobReceipt {
            job_id: "proc-1".to_string(),
        }));
        h.send("u1", InboundBody::Callback("select:1".to_string())).await;

        assert!(h.backend.recorded_calls().contains(&BackendCall::ProcessDocument {
            user_id: "u1".to_string(),
            document_id: "doc-2".to_string(),
        }));
        let session = h.session("u1").await;
        assert_eq!(session.state, ConversationState::Idle);
        assert!(session.state_context.flow_jobs.is_empty());
        let job = h.orchestrator.jobs().get("proc-1").await.unwrap().unwrap();
        assert_eq!((job.kind, job.label.as_str()), (JobKind::Process, "Report 2"));
    }

    #[tokio::test]
    async fn test_typed_selection_far_past_the_list_is_rejected() {
        let h = Harness::new();
        h.backend.queue_search(Ok(SearchResponse {
            answer: None,
            citations: (1..=7).map(|i| citation(&i.to_string(), &format!("doc-{i}"))).collect(),
        }));
        h.say("u1", "quarterly report").await;
        h.say("u1", "/documents").await;
        h.send("u1", InboundBody::Callback("page:next".to_string())).await;

        let reply = h.say("u1", "18446744073709551615").await;
        assert!(reply.contains("isn't on the list"), "{reply}");
        let reply = h.say("u1", "6").await;
        assert!(reply.contains("isn't on the list"), "{reply}");
        assert!(!h
            .backend
            .recorded_calls()
            .iter()
            .any(|call| matches!(call, BackendCall::ProcessDocument { .. })));
        assert!(matches!(
            h.session("u1").await.state,
            ConversationState::AwaitingDocumentSelection { page: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_typed_platform_choice_is_not_charged_to_search() {
        let mut config = Config::default();
        config.rate_limits.insert(CommandClass::Search, RateLimit::new(1, 60));
        let h = Harness::with_config(&config);

        h.backend.queue_search(Ok(SearchResponse::default()));
        h.say("u1", "quarterly numbers").await;
        assert!(h.say("u1", "more numbers").await.contains("too quickly"));

        h.say("u1", "/connect").await;
        h.backend.queue_connection(Ok(PlatformConnection {
            connection_id: "conn-1".to_string(),
            oauth_url: None,
            job_id: None,
        }));
        let reply = h.say("u1", "2").await;
        assert!(!reply.contains("too quickly"), "{reply}");
        assert!(h.backend.recorded_calls().contains(&BackendCall::ConnectPlatform {
            user_id: "u1".to_string(),
            platform: "slack".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_sources_and_fetch() {
        let h = Harness::new();
        h.backend.queue_sources(Ok(vec![source("src-1", "active"), source("src-2", "error")]));
        let listing = h.say("u1", "/sources").await;
        assert!(listing.contains("1. ✅ Source src-1"), "{listing}");
        assert!(listing.contains("2. ❌ Source src-2"), "{listing}");

        h.backend.queue_sources(Ok(vec![source("src-1", "active"), source("src-2", "error")]));
        let picker = h.send("u1", InboundBody::Text("/fetch".to_string())).await;
        let events: Vec<&str> = picker.quick_actions.iter().map(|a| a.event.as_str()).collect();
        assert_eq!(events, vec!["cmd:/fetch src-1"]);

        h.backend.queue_fetch(Ok(FetchSummary {
            source_name: Some("Team Drive".to_string()),
            item_count: 12,
            ..FetchSummary::default()
        }));
        let fetched = h.send("u1", InboundBody::Callback("cmd:/fetch src-1".to_string())).await;
        assert!(fetched.reply_text.contains("Fetched 12 items from Team Drive"));
        assert!(h.backend.recorded_calls().contains(&BackendCall::FetchDocuments {
            user_id: "u1".to_string(),
            source: "src-1".to_string(),
        }));

        // nothing queued: the backend is unreachable
        assert!(h.say("u1", "/fetch src-1").await.contains("fetch didn't go through"));
        assert_eq!(h.session("u1").await.state, ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_admin_manages_allow_list() {
        let mut config = Config::default();
        config.access = AccessPolicy::new(
            HashSet::from(["alice".to_string()]),
            HashSet::from(["root".to_string()]),
        );
        let h = Harness::with_config(&config);

        assert!(h.say("mallory", "/help").await.contains("not authorized"));
        assert!(h.say("alice", "/admin add_user mallory").await.contains("admin privileges"));

        assert!(h.say("root", "/admin add_user mallory").await.contains("added"));
        assert!(h.say("root", "/admin add_user mallory").await.contains("already"));
        assert!(h.say("mallory", "/help").await.contains("Commands"));

        let users = h.say("root", "/admin users").await;
        assert!(users.contains("👤 alice"), "{users}");
        assert!(users.contains("👤 mallory"), "{users}");
        assert!(users.contains("👑 root"), "{users}");

        assert!(h.say("root", "/admin remove_user mallory").await.contains("removed"));
        assert!(h.say("mallory", "/help").await.contains("not authorized"));
        assert!(h.say("root", "/admin remove_user root").await.contains("Can't remove"));
        assert!(h.say("root", "/admin promote alice").await.contains("Admin commands"));
    }

    #[tokio::test]
    async fn test_status_is_scoped_to_owner() {
        let h = Harness::new();
        upload(&h, "u1", "job-1").await;

        assert!(h.say("u1", "/status job-1").await.contains("job-1"));
        assert!(h.say("u2", "/status job-1").await.contains("don't know a job"));
        assert!(h.say("u1", "/status").await.contains("doc.pdf"));
        assert!(h.say("u2", "/status").await.contains("no background jobs"));
    }

    #[tokio::test]
    async fn test_admin_stats() {
        let mut config = Config::default();
        config.access = AccessPolicy::new(HashSet::new(), HashSet::from(["root".to_string()]));
        let h = Harness::with_config(&config);
        upload(&h, "u1", "job-1").await;

        assert!(h.say("u1", "/admin stats").await.contains("admin privileges"));
        let stats = h.say("root", "/admin stats").await;
        assert!(stats.contains("Active sessions: 1"), "{stats}");
        assert!(stats.contains("pending: 1"), "{stats}");
    }

    #[tokio::test]
    async fn test_reset_session_abandons_flow_jobs() {
        let h = Harness::new();
        sync_mid_connect(&h, "u1", "sync-1").await;

        assert!(h.orchestrator.reset_session("u1").await.unwrap());
        assert!(h.store.get("session:u1").await.unwrap().is_none());
        let job = h.orchestrator.jobs().get("sync-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Abandoned);

        assert!(!h.orchestrator.reset_session("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_events_for_one_user_are_serialized() {
        let h = Harness::new();
        for _ in 0..8 {
            h.backend.queue_search(Ok(results()));
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .handle(InboundEvent::new("u1", InboundBody::Text(format!("topic number {i}"))))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // each search saw the state the previous one left behind
        let searches = h.backend.searches();
        assert_eq!(searches.len(), 8);
        let longest = searches.iter().map(|q| q.split(' ').count()).max().unwrap();
        assert_eq!(longest, 8 * 3);
    }
}
