//! HTTP ingress
//!
//! Thin axum layer in front of the orchestrator: the chat transport posts
//! normalized events and drains notifications, the backend pushes job
//! status.

mod handlers;
mod types;

pub use handlers::create_router;

use crate::notify::Outbox;
use crate::orchestrator::Orchestrator;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub outbox: Arc<Outbox>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, outbox: Arc<Outbox>) -> Self {
        Self { orchestrator, outbox }
    }
}
