//! Tracking of asynchronous backend jobs
//!
//! The tracker owns the `job:{job_id}` keyspace. Status advances either by
//! polling (`poll_due` then `record_progress` / `record_poll_failure`) or by a
//! push callback; both settle through [`JobTracker::complete`], which notifies
//! at most once per job.

mod backoff;
mod status;

pub use backoff::next_interval;
pub use status::{validate_transition, JobStatus};

use crate::clock::{after, Clock};
use crate::locks::KeyedLocks;
use crate::store::{get_json, set_json, KvStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Job already registered: {0}")]
    Duplicate(String),
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Upload,
    Process,
    Sync,
    /// Searches are answered synchronously; kept for backends that queue them
    Search,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Upload => "upload",
            JobKind::Process => "process",
            JobKind::Sync => "sync",
            JobKind::Search => "search",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub kind: JobKind,
    /// Human-readable subject, e.g. the uploaded file name
    pub label: String,
    pub status: JobStatus,
    /// 0-100, advisory
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    /// Consecutive failed polls
    pub retry_count: u32,
    pub result: Option<Value>,
    /// Set when polling gave up without the backend ever reporting an outcome
    #[serde(default)]
    pub outcome_unknown: bool,
    /// Terminal status the backend reported after the job was abandoned
    #[serde(default)]
    pub remote_status: Option<JobStatus>,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub poll_interval: Duration,
    pub backoff_cap: Duration,
    pub max_retries: u32,
    /// How long terminal jobs stay queryable
    pub retention: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            max_retries: 5,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// A job reached Completed or Failed; deliver exactly once to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    pub user_id: String,
    pub job_id: String,
    pub kind: JobKind,
    pub label: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub outcome_unknown: bool,
}

impl JobNotification {
    fn for_job(job: &Job) -> Self {
        Self {
            user_id: job.user_id.clone(),
            job_id: job.job_id.clone(),
            kind: job.kind,
            label: job.label.clone(),
            status: job.status,
            result: job.result.clone(),
            outcome_unknown: job.outcome_unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub by_status: BTreeMap<JobStatus, usize>,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.by_status.values().sum()
    }
}

pub struct JobTracker {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: JobSettings,
    locks: KeyedLocks,
}

impl JobTracker {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: JobSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    fn key(job_id: &str) -> String {
        format!("job:{job_id}")
    }

    async fn load(&self, job_id: &str) -> JobResult<Job> {
        get_json(self.store.as_ref(), &Self::key(job_id))
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    async fn put(&self, job: &Job) -> JobResult<()> {
        let ttl = job.status.is_terminal().then_some(self.settings.retention);
        set_json(self.store.as_ref(), &Self::key(&job.job_id), job, ttl).await?;
        Ok(())
    }

    /// Start tracking a job in `Pending`; first poll after one poll interval.
    pub async fn register(
        &self,
        job_id: &str,
        user_id: &str,
        kind: JobKind,
        label: &str,
    ) -> JobResult<Job> {
        let _guard = self.locks.acquire(job_id).await;
        if self.store.get(&Self::key(job_id)).await?.is_some() {
            return Err(JobError::Duplicate(job_id.to_string()));
        }

        let now = self.clock.now();
        let job = Job {
            job_id: job_id.to_string(),
            user_id: user_id.to_string(),
            kind,
            label: label.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            created_at: now,
            last_polled_at: None,
            next_poll_at: after(now, self.settings.poll_interval),
            retry_count: 0,
            result: None,
            outcome_unknown: false,
            remote_status: None,
        };
        self.put(&job).await?;

        tracing::info!(job_id = %job_id, user_id = %user_id, kind = %kind, "Job registered");
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> JobResult<Option<Job>> {
        Ok(get_json(self.store.as_ref(), &Self::key(job_id)).await?)
    }

    async fn all(&self) -> JobResult<Vec<Job>> {
        let records = self.store.scan("job:").await?;
        Ok(records
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str::<Job>(&raw) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Skipping unreadable job record");
                    None
                }
            })
            .collect())
    }

    /// Non-terminal jobs whose next poll time has arrived, oldest due first.
    ///
    /// Computed fresh on every call, so a sweep that is interrupted simply
    /// picks the same jobs up next tick.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> JobResult<Vec<Job>> {
        let mut due: Vec<Job> = self
            .all()
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal() && job.next_poll_at <= now)
            .collect();
        due.sort_by_key(|job| job.next_poll_at);
        Ok(due)
    }

    /// Outstanding jobs owned by `user_id`
    pub async fn outstanding_for(&self, user_id: &str) -> JobResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .all()
            .await?
            .into_iter()
            .filter(|job| job.user_id == user_id && !job.status.is_terminal())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    /// Record a successful non-terminal poll. Resets the failure count.
    ///
    /// Returns false when the job has meanwhile reached a terminal status and
    /// the report is stale.
    pub async fn record_progress(&self, job_id: &str, status: JobStatus, progress: u8) -> JobResult<bool> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;

        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Ignoring progress for settled job");
            return Ok(false);
        }
        if status.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: status,
            });
        }
        // a report lagging behind what was already seen only refreshes the schedule
        if status > job.status {
            validate_transition(job_id, job.status, status)?;
            job.status = status;
        }

        let now = self.clock.now();
        job.progress = progress.min(100).max(job.progress);
        job.last_polled_at = Some(now);
        job.retry_count = 0;
        job.next_poll_at = after(now, self.settings.poll_interval);
        self.put(&job).await?;

        tracing::debug!(job_id = %job_id, status = %job.status, progress = job.progress, "Job progress");
        Ok(true)
    }

    /// Record a poll that failed to reach the backend.
    ///
    /// Backs the job off; once `max_retries` consecutive polls have failed
    /// the job is marked Failed with an unknown outcome and its notification
    /// returned.
    pub async fn record_poll_failure(&self, job_id: &str) -> JobResult<Option<JobNotification>> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(None);
        }

        let now = self.clock.now();
        job.last_polled_at = Some(now);
        job.retry_count = job.retry_count.saturating_add(1);

        if job.retry_count >= self.settings.max_retries {
            validate_transition(job_id, job.status, JobStatus::Failed)?;
            job.status = JobStatus::Failed;
            job.outcome_unknown = true;
            self.put(&job).await?;
            tracing::warn!(
                job_id = %job_id,
                user_id = %job.user_id,
                retries = job.retry_count,
                "Giving up on job, outcome unknown"
            );
            return Ok(Some(JobNotification::for_job(&job)));
        }

        let delay = next_interval(
            self.settings.poll_interval,
            self.settings.backoff_cap,
            job.retry_count,
        );
        job.next_poll_at = after(now, delay);
        self.put(&job).await?;
        tracing::info!(
            job_id = %job_id,
            retries = job.retry_count,
            delay_secs = delay.as_secs(),
            "Job poll failed, backing off"
        );
        Ok(None)
    }

    /// Settle a job with a terminal status reported by the backend.
    ///
    /// Idempotent: repeating the status it already has is a no-op and returns
    /// no notification. A job abandoned locally records the remote outcome
    /// but is never notified.
    pub async fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
    ) -> JobResult<Option<JobNotification>> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;

        match job.status {
            JobStatus::Abandoned if status.is_terminal() && status != JobStatus::Abandoned => {
                if job.remote_status.is_none() {
                    job.remote_status = Some(status);
                    job.result = result;
                    self.put(&job).await?;
                    tracing::info!(
                        job_id = %job_id,
                        user_id = %job.user_id,
                        remote_status = %status,
                        "Abandoned job finished remotely, recorded without notifying"
                    );
                }
                return Ok(None);
            }
            current if current == status => {
                tracing::debug!(job_id = %job_id, status = %status, "Job already settled");
                return Ok(None);
            }
            _ => {}
        }

        if !matches!(status, JobStatus::Completed | JobStatus::Failed) {
            return Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: status,
            });
        }
        validate_transition(job_id, job.status, status)?;

        job.status = status;
        if status == JobStatus::Completed {
            job.progress = 100;
        }
        job.result = result;
        job.last_polled_at = Some(self.clock.now());
        self.put(&job).await?;

        tracing::info!(
            job_id = %job_id,
            user_id = %job.user_id,
            status = %status,
            "Job settled"
        );
        Ok(Some(JobNotification::for_job(&job)))
    }

    /// Mark outstanding jobs Abandoned. Unknown or already terminal ids are
    /// skipped. Returns how many were abandoned.
    pub async fn abandon(&self, job_ids: &[String]) -> JobResult<usize> {
        let mut abandoned = 0;
        for job_id in job_ids {
            let _guard = self.locks.acquire(job_id).await;
            let mut job = match self.load(job_id).await {
                Ok(job) => job,
                Err(JobError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if job.status.is_terminal() {
                continue;
            }
            job.status = JobStatus::Abandoned;
            self.put(&job).await?;
            abandoned += 1;
            tracing::info!(job_id = %job_id, user_id = %job.user_id, "Job abandoned");
        }
        Ok(abandoned)
    }

    pub async fn stats(&self) -> JobResult<JobStats> {
        let mut stats = JobStats::default();
        for job in self.all().await? {
            *stats.by_status.entry(job.status).or_default() += 1;
        }
        Ok(stats)
    }
}
