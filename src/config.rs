//! Process configuration from the environment

use crate::auth::AccessPolicy;
use crate::backend::BackendConfig;
use crate::jobs::JobSettings;
use crate::rate_limit::{CommandClass, RateLimit};
use crate::state_machine::FlowSettings;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// SQLite file; in-memory store when unset
    pub db_path: Option<String>,
    pub backend: BackendConfig,
    pub session_ttl: Duration,
    pub jobs: JobSettings,
    /// How often the poller looks for due jobs
    pub job_sweep_interval: Duration,
    pub rate_limits: HashMap<CommandClass, RateLimit>,
    pub access: AccessPolicy,
    pub flow: FlowSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: None,
            backend: BackendConfig::default(),
            session_ttl: Duration::from_secs(30 * 60),
            jobs: JobSettings::default(),
            job_sweep_interval: Duration::from_secs(1),
            rate_limits: RateLimit::defaults(),
            access: AccessPolicy::default(),
            flow: FlowSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or malformed values keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env { lookup: &lookup };
        let mut config = Self::default();

        config.port = env.parsed("CONCIERGE_PORT", config.port);
        config.db_path = env.get("CONCIERGE_DB_PATH");

        if let Some(base_url) = env.get("BACKEND_BASE_URL") {
            config.backend.base_url = base_url;
        }
        if let Some(api_key) = env.get("BACKEND_API_KEY") {
            config.backend.api_key = api_key;
        }
        config.backend.timeout = env.secs("BACKEND_TIMEOUT_SECS", config.backend.timeout);
        config.backend.search_results_limit =
            env.parsed("SEARCH_RESULTS_LIMIT", config.backend.search_results_limit);

        config.session_ttl = env.minutes("SESSION_TIMEOUT_MINUTES", config.session_ttl);
        config.jobs.poll_interval = env.secs("JOB_POLL_INTERVAL_SECS", config.jobs.poll_interval);
        config.jobs.backoff_cap = env.secs("JOB_POLL_BACKOFF_CAP_SECS", config.jobs.backoff_cap);
        config.jobs.max_retries = env.parsed("JOB_MAX_RETRIES", config.jobs.max_retries);
        config.jobs.retention = env.hours("JOB_RETENTION_HOURS", config.jobs.retention);

        for class in CommandClass::ALL {
            let key = format!("RATE_LIMIT_{}", class.as_str().to_uppercase());
            let Some(raw) = env.get(&key) else {
                continue;
            };
            match RateLimit::parse(&raw) {
                Some(limit) => {
                    config.rate_limits.insert(class, limit);
                }
                None => tracing::warn!(%key, value = %raw, "Malformed rate limit, keeping default"),
            }
        }

        config.access = AccessPolicy::new(env.list("ALLOWED_USER_IDS"), env.list("ADMIN_USER_IDS"));

        let max_mb = env.parsed("MAX_FILE_SIZE_MB", config.flow.max_file_size_bytes / (1024 * 1024));
        config.flow.max_file_size_bytes = max_mb.saturating_mul(1024 * 1024);
        config.flow.pagination_size = env.parsed("PAGINATION_SIZE", config.flow.pagination_size).max(1);

        config
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.get(key) else {
            return default;
        };
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(%key, value = %raw, "Malformed setting, keeping default");
            default
        })
    }

    fn scaled(&self, key: &str, default: Duration, unit_secs: u64) -> Duration {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.parse::<u64>() {
                Ok(n) if n > 0 => Duration::from_secs(n.saturating_mul(unit_secs)),
                _ => {
                    tracing::warn!(%key, value = %raw, "Malformed duration, keeping default");
                    default
                }
            },
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.scaled(key, default, 1)
    }

    fn minutes(&self, key: &str, default: Duration) -> Duration {
        self.scaled(key, default, 60)
    }

    fn hours(&self, key: &str, default: Duration) -> Duration {
        self.scaled(key, default, 3600)
    }

    fn list(&self, key: &str) -> HashSet<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
