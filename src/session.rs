//! Per-user session records
//!
//! `SessionStore` owns the `session:{user_id}` keyspace. Expiry is decided
//! here by comparing against `expires_at`; the backing store only keeps the
//! record a little longer so an expired session can still be observed and
//! its flow cancelled.

use crate::clock::{after, Clock};
use crate::state_machine::ConversationState;
use crate::store::{get_json, set_json, KvStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How long past `expires_at` the backing store keeps a record around
const EXPIRED_RECORD_GRACE: Duration = Duration::from_secs(3600);

/// How many past queries are offered as shortcuts
pub const SEARCH_HISTORY_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Unauthorized caller; never persisted
    Guest,
    #[default]
    User,
    Admin,
}

/// Data carried across steps of the user's flows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateContext {
    /// Outstanding jobs started by this user's flows. Cancelled with the flow.
    #[serde(default)]
    pub flow_jobs: Vec<String>,
    /// Most recent search queries, newest first
    #[serde(default)]
    pub search_history: Vec<String>,
}

impl StateContext {
    pub fn remember_query(&mut self, query: &str) {
        self.search_history.retain(|q| q != query);
        self.search_history.insert(0, query.to_string());
        self.search_history.truncate(SEARCH_HISTORY_LEN);
    }

    /// Returns true if the job was tracked here.
    pub fn forget_job(&mut self, job_id: &str) -> bool {
        let before = self.flow_jobs.len();
        self.flow_jobs.retain(|id| id != job_id);
        self.flow_jobs.len() != before
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: String,
    pub role: Role,
    pub state: ConversationState,
    #[serde(default)]
    pub state_context: StateContext,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, role: Role, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            state: ConversationState::Idle,
            state_context: StateContext::default(),
            created_at: now,
            last_active_at: now,
            expires_at: after(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Back to `Idle` with nothing carried over
    pub fn reset(&mut self) {
        self.state = ConversationState::Idle;
        self.state_context = StateContext::default();
    }
}

/// Result of looking a user up
#[derive(Debug)]
pub struct Loaded {
    /// The live session; fresh and `Idle` if none was live
    pub session: UserSession,
    /// The record that was found past its expiry, if any
    pub expired: Option<UserSession>,
}

pub struct SessionStore {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    fn key(user_id: &str) -> String {
        format!("session:{user_id}")
    }

    /// Load the user's session, reporting a record found past its expiry.
    ///
    /// `role` is the currently resolved role; it replaces whatever was stored.
    pub async fn load(&self, user_id: &str, role: Role) -> StoreResult<Loaded> {
        let now = self.clock.now();
        let fresh = || UserSession::new(user_id, role, now, self.ttl);

        let stored = match get_json::<UserSession>(self.store.as_ref(), &Self::key(user_id)).await {
            Ok(stored) => stored,
            Err(StoreError::Corrupt { key, message }) => {
                tracing::warn!(%key, error = %message, "Discarding unreadable session record");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(match stored {
            Some(session) if session.is_expired(now) => {
                tracing::info!(
                    user_id = %user_id,
                    state = session.state.name(),
                    expired_at = %session.expires_at,
                    "Session expired"
                );
                Loaded {
                    session: fresh(),
                    expired: Some(session),
                }
            }
            Some(mut session) => {
                session.role = role;
                Loaded {
                    session,
                    expired: None,
                }
            }
            None => Loaded {
                session: fresh(),
                expired: None,
            },
        })
    }

    /// The live session, or a fresh `Idle` one if absent or expired
    pub async fn get_or_create(&self, user_id: &str, role: Role) -> StoreResult<UserSession> {
        Ok(self.load(user_id, role).await?.session)
    }

    /// Persist the full record, refreshing `last_active_at` and `expires_at`.
    pub async fn save(&self, session: &mut UserSession) -> StoreResult<()> {
        if session.role == Role::Guest {
            return Ok(());
        }
        let now = self.clock.now();
        session.last_active_at = now;
        session.expires_at = after(now, self.ttl);
        set_json(
            self.store.as_ref(),
            &Self::key(&session.user_id),
            session,
            Some(self.ttl.saturating_add(EXPIRED_RECORD_GRACE)),
        )
        .await
    }

    pub async fn delete(&self, user_id: &str) -> StoreResult<bool> {
        self.store.delete(&Self::key(user_id)).await
    }

    /// Number of sessions that have not expired
    pub async fn count_active(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let records = self.store.scan("session:").await?;
        Ok(records
            .iter()
            .filter_map(|(_, raw)| serde_json::from_str::<UserSession>(raw).ok())
            .filter(|session| !session.is_expired(now))
            .count())
    }
}
