//! Event orchestration
//!
//! `handle` runs one inbound event end to end: role check, rate limit, then
//! under the user's lock: load session, transition, execute effects, feed
//! backend results back through `transition`, save. Job settlement takes
//! the same user lock so a completion never races an inbound event for the
//! same session. Lock order is always user then job.

#[cfg(test)]
pub mod testing;

use crate::auth::AccessPolicy;
use crate::backend::{BackendClient, BackendError, BackendOperation};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::CoreError;
use crate::jobs::{JobError, JobKind, JobNotification, JobStatus, JobTracker};
use crate::locks::KeyedLocks;
use crate::notify::Notifier;
use crate::rate_limit::{Admission, RateLimiter};
use crate::reply;
use crate::session::{Loaded, Role, SessionStore, UserSession};
use crate::state_machine::{transition, Disposition, Effect, Event, FlowSettings, UploadPurpose};
use crate::store::KvStore;
use crate::wire::{InboundEvent, ResponseDescriptor};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Job status polls in flight at once during a sweep
const MAX_CONCURRENT_POLLS: usize = 8;

/// What a poll or push learned about a job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The backend reported a terminal status
    Reported { status: JobStatus, result: Option<Value> },
    /// The job is still pending or running
    Progress { status: JobStatus, progress: u8 },
    /// The backend could not be asked
    PollFailed,
}

pub struct Orchestrator {
    store: Arc<dyn KvStore>,
    sessions: SessionStore,
    jobs: JobTracker,
    limiter: RateLimiter,
    backend: Arc<dyn BackendClient>,
    notifier: Arc<dyn Notifier>,
    access: AccessPolicy,
    flow: FlowSettings,
    clock: Arc<dyn Clock>,
    user_locks: KeyedLocks,
    backend_timeout: Duration,
    sweep_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        store: Arc<dyn KvStore>,
        backend: Arc<dyn BackendClient>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(store.clone(), clock.clone(), config.session_ttl),
            jobs: JobTracker::new(store.clone(), clock.clone(), config.jobs.clone()),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            store,
            backend,
            notifier,
            access: config.access.clone(),
            flow: config.flow.clone(),
            clock,
            user_locks: KeyedLocks::new(),
            backend_timeout: config.backend.timeout,
            sweep_interval: config.job_sweep_interval,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Handle one inbound event and produce the reply for the transport.
    ///
    /// Only store failures are returned as errors; everything else becomes
    /// part of the reply.
    pub async fn handle(&self, inbound: InboundEvent) -> Result<ResponseDescriptor, CoreError> {
        let user_id = inbound.user_id.as_str();
        let event = Event::from_inbound(&inbound.body);
        tracing::debug!(user_id = %user_id, event = event.name(), "Inbound event");

        let role = self.access.resolve(user_id, inbound.role_hint);
        if role == Role::Guest {
            let error = CoreError::AuthRejected(user_id.to_string());
            tracing::warn!(user_id = %user_id, error_kind = error.kind(), "Rejected unauthorized user");
            return Ok(reply::for_error(&error));
        }

        let _guard = self.user_locks.acquire(user_id).await;
        let loaded = self.load_session(user_id, role).await?;

        // typed answers are charged to the flow they answer
        let class = event.command_class(&loaded.session.state);
        if let Admission::Rejected { retry_after } = self.limiter.admit(user_id, class, self.clock.now()) {
            let error = CoreError::RateLimitExceeded { class, retry_after };
            tracing::warn!(
                user_id = %user_id,
                class = %class,
                retry_after_secs = retry_after.as_secs(),
                error_kind = error.kind(),
                "Rate limited"
            );
            return Ok(reply::for_error(&error));
        }

        let mut replies = Vec::new();
        if let Some(expired) = loaded.expired {
            self.run(expired, Event::SessionExpired, &mut replies).await?;
        }
        let mut session = self.run(loaded.session, event, &mut replies).await?;

        self.sessions.save(&mut session).await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Failed to save session");
            CoreError::SessionStoreUnavailable(e)
        })?;

        Ok(ResponseDescriptor::merge(replies))
    }

    async fn load_session(&self, user_id: &str, role: Role) -> Result<Loaded, CoreError> {
        self.sessions.load(user_id, role).await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Failed to load session");
            CoreError::SessionStoreUnavailable(e)
        })
    }

    /// Drive `event` and every backend result it leads to through the
    /// state machine, collecting replies.
    async fn run(
        &self,
        mut session: UserSession,
        event: Event,
        replies: &mut Vec<ResponseDescriptor>,
    ) -> Result<UserSession, CoreError> {
        let mut events = VecDeque::from([event]);

        while let Some(current) = events.pop_front() {
            let event_name = current.name();
            let result = transition(&session, &self.flow, current);

            match &result.disposition {
                Disposition::Ignored(reason) => {
                    let error = CoreError::InvalidStateTransition(reason.clone());
                    tracing::info!(
                        user_id = %session.user_id,
                        event = event_name,
                        state = session.state.name(),
                        error_kind = error.kind(),
                        reason = %reason,
                        "Event ignored"
                    );
                }
                Disposition::Applied if result.session.state != session.state => {
                    tracing::debug!(
                        user_id = %session.user_id,
                        event = event_name,
                        from = session.state.name(),
                        to = result.session.state.name(),
                        "State transition"
                    );
                }
                Disposition::Applied => {}
            }

            let backend_calls = result.effects.iter().filter(|e| e.is_backend_call()).count();
            if backend_calls > 0 {
                tracing::debug!(user_id = %session.user_id, event = event_name, backend_calls, "Dispatching backend calls");
            }

            session = result.session;
            for effect in result.effects {
                if let Some(follow_up) = self.execute_effect(&session, effect, replies).await? {
                    events.push_back(follow_up);
                }
            }
        }

        Ok(session)
    }

    /// Execute one effect. Backend calls return the event carrying their
    /// result.
    async fn execute_effect(
        &self,
        session: &UserSession,
        effect: Effect,
        replies: &mut Vec<ResponseDescriptor>,
    ) -> Result<Option<Event>, CoreError> {
        let user_id = session.user_id.as_str();
        match effect {
            Effect::Reply(response) => {
                replies.push(response);
                Ok(None)
            }

            Effect::Search { query } => {
                let outcome = self
                    .call(BackendOperation::Search, user_id, self.backend.search(user_id, &query))
                    .await;
                Ok(Some(match outcome {
                    Ok(response) => Event::SearchCompleted { query, response },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::Search,
                        error,
                    },
                }))
            }

            Effect::Upload { file, purpose } => {
                let metadata = match &purpose {
                    UploadPurpose::Index => json!({ "purpose": "index", "content_type": file.content_type() }),
                    UploadPurpose::AttachToJob { job_id } => json!({
                        "purpose": "attach",
                        "parent_job_id": job_id,
                        "content_type": file.content_type(),
                    }),
                };
                let outcome = self
                    .call(
                        BackendOperation::Upload,
                        user_id,
                        self.backend.upload(user_id, &file, &metadata),
                    )
                    .await;
                Ok(Some(match outcome {
                    Ok(receipt) => Event::UploadAccepted {
                        file_name: file.file_name,
                        receipt,
                    },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::Upload,
                        error,
                    },
                }))
            }

            Effect::ConnectPlatform { platform } => {
                let params = json!({});
                let outcome = self
                    .call(
                        BackendOperation::ConnectPlatform,
                        user_id,
                        self.backend.connect_platform(user_id, &platform, &params),
                    )
                    .await;
                Ok(Some(match outcome {
                    Ok(connection) => Event::PlatformConnected { platform, connection },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::ConnectPlatform,
                        error,
                    },
                }))
            }

            Effect::ProcessDocument { document_id, title } => {
                let outcome = self
                    .call(
                        BackendOperation::ProcessDocument,
                        user_id,
                        self.backend.process_document(user_id, &document_id),
                    )
                    .await;
                Ok(Some(match outcome {
                    Ok(receipt) => Event::JobStarted {
                        kind: JobKind::Process,
                        label: title,
                        job_id: receipt.job_id,
                    },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::ProcessDocument,
                        error,
                    },
                }))
            }

            Effect::SyncSource { source } => {
                let outcome = self
                    .call(
                        BackendOperation::SyncSource,
                        user_id,
                        self.backend.sync_source(user_id, &source),
                    )
                    .await;
                Ok(Some(match outcome {
                    Ok(receipt) => Event::JobStarted {
                        kind: JobKind::Sync,
                        label: format!("{source} sync"),
                        job_id: receipt.job_id,
                    },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::SyncSource,
                        error,
                    },
                }))
            }

            Effect::ListSources { listing } => {
                let outcome = self
                    .call(BackendOperation::GetSources, user_id, self.backend.get_sources(user_id))
                    .await;
                Ok(Some(match outcome {
                    Ok(sources) => Event::SourcesListed { listing, sources },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::GetSources,
                        error,
                    },
                }))
            }

            Effect::FetchDocuments { source } => {
                let outcome = self
                    .call(
                        BackendOperation::FetchDocuments,
                        user_id,
                        self.backend.fetch_documents(user_id, &source),
                    )
                    .await;
                Ok(Some(match outcome {
                    Ok(summary) => Event::DocumentsFetched { source, summary },
                    Err(error) => Event::BackendFailed {
                        operation: BackendOperation::FetchDocuments,
                        error,
                    },
                }))
            }

            Effect::RegisterJob { job_id, kind, label } => {
                match self.jobs.register(&job_id, user_id, kind, &label).await {
                    Ok(_) => {
                        tracing::info!(user_id = %user_id, job_id = %job_id, kind = %kind, "Job registered");
                    }
                    Err(JobError::Duplicate(_)) => {
                        tracing::warn!(user_id = %user_id, job_id = %job_id, "Job already registered");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(None)
            }

            Effect::AbandonJobs { job_ids } => {
                let abandoned = self.jobs.abandon(&job_ids).await?;
                tracing::info!(user_id = %user_id, abandoned, requested = job_ids.len(), "Abandoned flow jobs");
                Ok(None)
            }

            Effect::ReportJobStatus { job_id: Some(job_id) } => {
                let job = self.jobs.get(&job_id).await?.filter(|job| job.user_id == user_id);
                replies.push(match job {
                    Some(job) => reply::job_status(&job),
                    None => {
                        let error = CoreError::JobNotFound(job_id);
                        tracing::info!(user_id = %user_id, error_kind = error.kind(), "{error}");
                        reply::for_error(&error)
                    }
                });
                Ok(None)
            }

            Effect::ReportJobStatus { job_id: None } => {
                let jobs = self.jobs.outstanding_for(user_id).await?;
                replies.push(reply::job_list(&jobs));
                Ok(None)
            }

            Effect::ReportStats => {
                let active = self
                    .sessions
                    .count_active()
                    .await
                    .map_err(CoreError::SessionStoreUnavailable)?;
                let stats = self.jobs.stats().await?;
                replies.push(reply::stats(active, &stats));
                Ok(None)
            }

            Effect::ListUsers => {
                replies.push(reply::user_list(self.access.is_open(), &self.access.members()));
                Ok(None)
            }

            Effect::GrantAccess { user_id: target } => {
                let added = self.access.grant(&target);
                tracing::info!(user_id = %user_id, target = %target, added, "Allow-list grant");
                replies.push(reply::user_added(&target, added));
                Ok(None)
            }

            Effect::RevokeAccess { user_id: target } => {
                let removed = self.access.revoke(&target);
                tracing::info!(user_id = %user_id, target = %target, removed, "Allow-list revoke");
                replies.push(reply::user_removed(&target, removed));
                Ok(None)
            }
        }
    }

    /// Run a backend call under the configured timeout, logging the outcome.
    async fn call<T>(
        &self,
        operation: BackendOperation,
        user_id: &str,
        request: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.backend_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(format!(
                "{operation} did not finish within {}ms",
                self.backend_timeout.as_millis()
            ))),
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => tracing::info!(user_id = %user_id, operation = %operation, latency_ms, "Backend call succeeded"),
            Err(error) => tracing::warn!(
                user_id = %user_id,
                operation = %operation,
                latency_ms,
                error_kind = error.kind.as_str(),
                retryable = error.kind.is_retryable(),
                error = %error,
                "Backend call failed"
            ),
        }
        result
    }

    /// Explicit logout: drop the user's session and abandon its flow jobs.
    /// Returns whether a session existed.
    pub async fn reset_session(&self, user_id: &str) -> Result<bool, CoreError> {
        let _guard = self.user_locks.acquire(user_id).await;
        let role = self.access.resolve(user_id, None);
        let loaded = self.load_session(user_id, role).await?;

        let mut job_ids = loaded.session.state_context.flow_jobs;
        if let Some(expired) = loaded.expired {
            job_ids.extend(expired.state_context.flow_jobs);
        }
        if !job_ids.is_empty() {
            let abandoned = self.jobs.abandon(&job_ids).await?;
            tracing::info!(user_id = %user_id, abandoned, "Abandoned flow jobs on reset");
        }

        let existed = self
            .sessions
            .delete(user_id)
            .await
            .map_err(CoreError::SessionStoreUnavailable)?;
        tracing::info!(user_id = %user_id, existed, "Session reset");
        Ok(existed)
    }

    // ========================================================================
    // Job settlement
    // ========================================================================

    /// Apply a poll or push outcome to a job and tell its owner if it
    /// settled.
    ///
    /// Runs under the owner's lock. If the owner's session has expired, the
    /// expiry is processed first, which abandons the flow's jobs; a job
    /// abandoned that way records the outcome without a notification. Progress
    /// reports come through here too, so expiry is seen while the expired
    /// record is still stored.
    pub async fn settle(
        &self,
        user_id: &str,
        job_id: &str,
        outcome: Outcome,
    ) -> Result<Option<JobNotification>, CoreError> {
        let _guard = self.user_locks.acquire(user_id).await;
        let role = self.access.resolve(user_id, None);
        let loaded = self.load_session(user_id, role).await?;
        let mut session = loaded.session;
        let mut dirty = false;

        if let Some(expired) = loaded.expired {
            let mut notices = Vec::new();
            self.run(expired, Event::SessionExpired, &mut notices).await?;
            for notice in notices {
                self.notifier.notify(user_id, notice).await;
            }
            dirty = true;
        }

        let note = match outcome {
            Outcome::Reported { status, result } => self.jobs.complete(job_id, status, result).await?,
            Outcome::Progress { status, progress } => {
                self.jobs.record_progress(job_id, status, progress).await?;
                None
            }
            Outcome::PollFailed => self.jobs.record_poll_failure(job_id).await?,
        };

        if let Some(note) = &note {
            dirty |= session.state_context.forget_job(job_id);
            self.notifier.notify(user_id, reply::job_finished(note)).await;
            tracing::info!(user_id = %user_id, job_id = %job_id, status = %note.status, "Job notification sent");
        }

        if dirty {
            self.sessions
                .save(&mut session)
                .await
                .map_err(CoreError::SessionStoreUnavailable)?;
        }
        Ok(note)
    }

    /// Status pushed by the backend for a job. Goes through the same
    /// idempotent settlement as polls.
    pub async fn job_callback(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: u8,
        result: Option<Value>,
    ) -> Result<(), CoreError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;

        let outcome = if status.is_terminal() {
            Outcome::Reported { status, result }
        } else {
            Outcome::Progress { status, progress }
        };
        self.settle(&job.user_id, job_id, outcome).await?;
        Ok(())
    }

    /// One polling pass: every due job is asked for its status once.
    /// Returns how many jobs were polled.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.limiter.sweep(now);
        match self.store.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged expired records"),
            Err(e) => tracing::error!(error = %e, "Failed to purge expired records"),
        }

        let due = match self.jobs.poll_due(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list due jobs");
                return 0;
            }
        };
        let polled = due.len();

        futures::stream::iter(due)
            .for_each_concurrent(MAX_CONCURRENT_POLLS, |job| async move {
                self.poll_one(&job.user_id, &job.job_id).await;
            })
            .await;
        polled
    }

    async fn poll_one(&self, user_id: &str, job_id: &str) {
        let report = self
            .call(
                BackendOperation::FetchJobStatus,
                user_id,
                self.backend.fetch_job_status(job_id),
            )
            .await;

        let outcome = match report {
            Ok(report) if report.status.is_terminal() => Outcome::Reported {
                status: report.status,
                result: report.result,
            },
            Ok(report) => Outcome::Progress {
                status: report.status,
                progress: report.progress,
            },
            Err(_) => Outcome::PollFailed,
        };

        if let Err(e) = self.settle(user_id, job_id, outcome).await {
            tracing::error!(user_id = %user_id, job_id = %job_id, error_kind = e.kind(), error = %e, "Job poll failed");
        }
    }

    /// Sweep on a fixed interval until cancelled.
    pub async fn run_job_poller(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval = ?self.sweep_interval, "Job poller started");
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        tracing::info!("Job poller stopped");
    }
}
