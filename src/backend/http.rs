//! REST client for the backend service

use super::{
    classify_status, with_error, BackendClient, BackendError, FetchSummary, JobReceipt, JobStatusReport,
    PlatformConnection, SearchResponse, SourceInfo, UploadReceipt,
};
use crate::jobs::JobStatus;
use crate::wire::FileRef;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// `top_k` sent with every search
    pub search_results_limit: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            search_results_limit: 10,
        }
    }
}

pub struct HttpBackendClient {
    client: Client,
    config: BackendConfig,
}

impl HttpBackendClient {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::invalid(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder, user_id: Option<&str>) -> RequestBuilder {
        let mut request = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("X-API-Key", &self.config.api_key);
        if let Some(user_id) = user_id {
            request = request.header("X-Bot-User-ID", user_id);
        }
        request
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::timeout(format!("Request timeout: {e}"))
            } else if e.is_connect() {
                BackendError::unavailable(format!("Connection failed: {e}"))
            } else {
                BackendError::invalid(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::timeout(format!("Timed out reading response: {e}"))
            } else {
                BackendError::unavailable(format!("Failed to read response: {e}"))
            }
        })?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            BackendError::status(
                status.as_u16(),
                format!("Failed to parse response: {e} - body: {body}"),
            )
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        user_id: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BackendError> {
        let request = self
            .authorize(self.client.get(self.url(path)), Some(user_id))
            .query(query);
        self.send(request).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        user_id: &str,
        body: &Value,
    ) -> Result<T, BackendError> {
        let request = self.authorize(self.client.post(self.url(path)), Some(user_id)).json(body);
        self.send(request).await
    }
}

/// Job status as the backend spells it
#[derive(Debug, Deserialize)]
struct RawJobStatus {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl From<RawJobStatus> for JobStatusReport {
    fn from(raw: RawJobStatus) -> Self {
        Self {
            status: JobStatus::from_remote(&raw.status),
            progress: clamp_progress(raw.progress),
            result: with_error(raw.result, raw.error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SourceList {
    #[serde(default)]
    sources: Vec<SourceInfo>,
}

/// Percentage from a backend float, 0 when missing or not a number
fn clamp_progress(raw: Option<f64>) -> u8 {
    let Some(pct) = raw.filter(|p| p.is_finite()) else {
        return 0;
    };
    (0u8..=100)
        .rev()
        .find(|step| f64::from(*step) <= pct)
        .unwrap_or(0)
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn search(&self, user_id: &str, query: &str) -> Result<SearchResponse, BackendError> {
        let body = json!({
            "user_id": user_id,
            "query": query,
            "top_k": self.config.search_results_limit,
            "include_citations": true,
        });
        self.post("/api/search", user_id, &body).await
    }

    async fn upload(
        &self,
        user_id: &str,
        file: &FileRef,
        metadata: &Value,
    ) -> Result<UploadReceipt, BackendError> {
        let body = json!({
            "user_id": user_id,
            "file_name": file.file_name,
            "file_url": file.location,
            "content_type": file.content_type(),
            "size_bytes": file.size_bytes,
            "metadata": metadata,
        });
        self.post("/api/upload", user_id, &body).await
    }

    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusReport, BackendError> {
        let request = self
            .authorize(self.client.get(self.url("/api/job-status")), None)
            .query(&[("job_id", job_id)]);
        let raw: RawJobStatus = self.send(request).await?;
        Ok(raw.into())
    }

    async fn connect_platform(
        &self,
        user_id: &str,
        platform: &str,
        params: &Value,
    ) -> Result<PlatformConnection, BackendError> {
        let body = json!({
            "user_id": user_id,
            "platform": platform,
            "params": params,
        });
        self.post("/api/connect", user_id, &body).await
    }

    async fn process_document(&self, user_id: &str, document_id: &str) -> Result<JobReceipt, BackendError> {
        let body = json!({
            "user_id": user_id,
            "document_id": document_id,
            "operations": ["extract", "summarize", "index"],
        });
        self.post("/api/process-document", user_id, &body).await
    }

    async fn sync_source(&self, user_id: &str, source: &str) -> Result<JobReceipt, BackendError> {
        let body = json!({
            "user_id": user_id,
            "source_id": source,
            "mode": "incremental",
        });
        self.post("/api/sync", user_id, &body).await
    }

    async fn get_sources(&self, user_id: &str) -> Result<Vec<SourceInfo>, BackendError> {
        let list: SourceList = self.get("/api/sources", user_id, &[]).await?;
        Ok(list.sources)
    }

    async fn fetch_documents(&self, user_id: &str, source: &str) -> Result<FetchSummary, BackendError> {
        self.get("/api/fetch", user_id, &[("source_id", source), ("user_id", user_id)])
            .await
    }
}
