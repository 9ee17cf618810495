//! Outbound notifications
//!
//! Job settlement produces messages for a user outside any request/reply
//! exchange. They go through a `Notifier`; the transport decides how they
//! reach the user. `Outbox` queues them per user until the transport drains
//! them.

use crate::wire::ResponseDescriptor;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, message: ResponseDescriptor);
}

/// Per-user FIFO of undelivered notifications
#[derive(Default)]
pub struct Outbox {
    queues: Mutex<HashMap<String, VecDeque<ResponseDescriptor>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything queued for `user_id`, oldest first
    pub fn drain(&self, user_id: &str) -> Vec<ResponseDescriptor> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .remove(user_id)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for Outbox {
    async fn notify(&self, user_id: &str, message: ResponseDescriptor) {
        tracing::debug!(user_id = %user_id, "Queued notification");
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.entry(user_id.to_string()).or_default().push_back(message);
    }
}
