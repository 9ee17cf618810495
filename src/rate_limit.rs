//! Sliding-window admission control per user and command class
//!
//! Each `(user_id, class)` keeps the timestamps it admitted during the last
//! window. A timestamp exactly one window old has already left the window,
//! so a request arriving on that boundary counts toward the new one.

use crate::clock::{after, before, until};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Rate-limiting bucket, coarser than the literal command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    Search,
    Upload,
    Connect,
    Jobs,
    General,
}

impl CommandClass {
    pub const ALL: [CommandClass; 5] = [
        CommandClass::Search,
        CommandClass::Upload,
        CommandClass::Connect,
        CommandClass::Jobs,
        CommandClass::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandClass::Search => "search",
            CommandClass::Upload => "upload",
            CommandClass::Connect => "connect",
            CommandClass::Jobs => "jobs",
            CommandClass::General => "general",
        }
    }
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Parse `L/W`, `W` in seconds
    pub fn parse(raw: &str) -> Option<Self> {
        let (limit, window) = raw.trim().split_once('/')?;
        let limit = limit.trim().parse().ok()?;
        let window: u64 = window.trim().trim_end_matches('s').parse().ok()?;
        (window > 0).then(|| Self::new(limit, window))
    }

    pub fn defaults() -> HashMap<CommandClass, RateLimit> {
        HashMap::from([
            (CommandClass::Search, RateLimit::new(10, 60)),
            (CommandClass::Upload, RateLimit::new(5, 3600)),
            (CommandClass::Connect, RateLimit::new(5, 300)),
            (CommandClass::Jobs, RateLimit::new(10, 300)),
            (CommandClass::General, RateLimit::new(30, 60)),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

pub struct RateLimiter {
    limits: HashMap<CommandClass, RateLimit>,
    windows: Mutex<HashMap<(String, CommandClass), VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<CommandClass, RateLimit>) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and, if admitted, record one request. Classes without a
    /// configured limit are always admitted.
    pub fn admit(&self, user_id: &str, class: CommandClass, now: DateTime<Utc>) -> Admission {
        let Some(limit) = self.limits.get(&class).copied() else {
            return Admission::Allowed;
        };

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let admitted = windows.entry((user_id.to_string(), class)).or_default();

        let horizon = before(now, limit.window);
        while admitted.front().is_some_and(|&t| t <= horizon) {
            admitted.pop_front();
        }

        if admitted.len() < usize::try_from(limit.limit).unwrap_or(usize::MAX) {
            admitted.push_back(now);
            return Admission::Allowed;
        }

        let retry_after = admitted
            .front()
            .map_or(limit.window, |&oldest| until(now, after(oldest, limit.window)));
        Admission::Rejected { retry_after }
    }

    /// Drop windows with nothing left inside them.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|(_, class), admitted| {
            let Some(limit) = self.limits.get(class) else {
                return false;
            };
            let horizon = before(now, limit.window);
            admitted.back().is_some_and(|&newest| newest > horizon)
        });
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}
