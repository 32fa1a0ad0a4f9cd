use std::env;

use crate::db::tables::CronJobDefaults;
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;

/// Environment variable names - single source of truth
pub mod env_vars {
    pub const PORT: &str = "PORT";
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const SCHEDULER_ENABLED: &str = "SCHEDULER_ENABLED";
    pub const POLL_INTERVAL_SECS: &str = "SCHEDULER_POLL_INTERVAL_SECS";
    pub const MAX_CONCURRENT: &str = "SCHEDULER_MAX_CONCURRENT";
    pub const CRON_DEFAULT_TIMEOUT_MS: &str = "CRON_DEFAULT_TIMEOUT_MS";
    pub const CRON_DEFAULT_MAX_RETRIES: &str = "CRON_DEFAULT_MAX_RETRIES";
    pub const RETRY_BACKOFF_BASE_MS: &str = "RETRY_BACKOFF_BASE_MS";
    pub const RETRY_BACKOFF_MAX_MS: &str = "RETRY_BACKOFF_MAX_MS";
    pub const TASK_DEFAULT_TIMEOUT_MS: &str = "TASK_DEFAULT_TIMEOUT_MS";
    pub const SHUTDOWN_GRACE_SECS: &str = "SHUTDOWN_GRACE_SECS";
    pub const AGENT_EXECUTOR_URL: &str = "AGENT_EXECUTOR_URL";
}

/// Default values
pub mod defaults {
    pub const PORT: u16 = 8080;
    pub const DATABASE_URL: &str = "./.db/orchestrator.db";
    pub const POLL_INTERVAL_SECS: u64 = 30;
    pub const MAX_CONCURRENT: usize = 8;
    pub const CRON_DEFAULT_TIMEOUT_MS: u64 = 300_000;
    pub const CRON_DEFAULT_MAX_RETRIES: u32 = 2;
    pub const RETRY_BACKOFF_BASE_MS: u64 = 1_000;
    pub const RETRY_BACKOFF_MAX_MS: u64 = 30_000;
    pub const TASK_DEFAULT_TIMEOUT_MS: u64 = 600_000;
    pub const SHUTDOWN_GRACE_SECS: u64 = 10;
    /// Default page size for listing endpoints
    pub const LIST_LIMIT: u32 = 50;
    /// Hard cap for "all" views
    pub const LIST_LIMIT_MAX: u32 = 200;
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparseable {}={:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub poll_interval_secs: u64,
    /// Global cap on simultaneously active runs (0 = unbounded)
    pub max_concurrent: usize,
    pub cron_default_timeout_ms: u64,
    pub cron_default_max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub task_default_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
    pub agent_executor_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let agent_executor_url = env::var(env_vars::AGENT_EXECUTOR_URL)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            port: env_parse(env_vars::PORT, defaults::PORT),
            database_url: env::var(env_vars::DATABASE_URL)
                .unwrap_or_else(|_| defaults::DATABASE_URL.to_string()),
            scheduler_enabled: env_flag(env_vars::SCHEDULER_ENABLED, true),
            poll_interval_secs: env_parse(env_vars::POLL_INTERVAL_SECS, defaults::POLL_INTERVAL_SECS)
                .max(1),
            max_concurrent: env_parse(env_vars::MAX_CONCURRENT, defaults::MAX_CONCURRENT),
            cron_default_timeout_ms: env_parse(
                env_vars::CRON_DEFAULT_TIMEOUT_MS,
                defaults::CRON_DEFAULT_TIMEOUT_MS,
            ),
            cron_default_max_retries: env_parse(
                env_vars::CRON_DEFAULT_MAX_RETRIES,
                defaults::CRON_DEFAULT_MAX_RETRIES,
            ),
            retry_backoff_base_ms: env_parse(
                env_vars::RETRY_BACKOFF_BASE_MS,
                defaults::RETRY_BACKOFF_BASE_MS,
            ),
            retry_backoff_max_ms: env_parse(
                env_vars::RETRY_BACKOFF_MAX_MS,
                defaults::RETRY_BACKOFF_MAX_MS,
            ),
            task_default_timeout_ms: env_parse(
                env_vars::TASK_DEFAULT_TIMEOUT_MS,
                defaults::TASK_DEFAULT_TIMEOUT_MS,
            ),
            shutdown_grace_secs: env_parse(
                env_vars::SHUTDOWN_GRACE_SECS,
                defaults::SHUTDOWN_GRACE_SECS,
            ),
            agent_executor_url,
        }
    }

    /// Scheduler settings derived from the process configuration
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: self.poll_interval_secs,
            max_concurrent: self.max_concurrent,
            retry: RetryPolicy {
                base_backoff_ms: self.retry_backoff_base_ms,
                max_backoff_ms: self.retry_backoff_max_ms,
            },
        }
    }

    /// Values applied to new cron jobs that omit `timeout_ms` / `max_retries`
    pub fn job_defaults(&self) -> CronJobDefaults {
        CronJobDefaults {
            timeout_ms: self.cron_default_timeout_ms,
            max_retries: self.cron_default_max_retries,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: defaults::PORT,
            database_url: defaults::DATABASE_URL.to_string(),
            scheduler_enabled: true,
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            max_concurrent: defaults::MAX_CONCURRENT,
            cron_default_timeout_ms: defaults::CRON_DEFAULT_TIMEOUT_MS,
            cron_default_max_retries: defaults::CRON_DEFAULT_MAX_RETRIES,
            retry_backoff_base_ms: defaults::RETRY_BACKOFF_BASE_MS,
            retry_backoff_max_ms: defaults::RETRY_BACKOFF_MAX_MS,
            task_default_timeout_ms: defaults::TASK_DEFAULT_TIMEOUT_MS,
            shutdown_grace_secs: defaults::SHUTDOWN_GRACE_SECS,
            agent_executor_url: None,
        }
    }
}

/// Clamp a caller-supplied page size to the configured bounds
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit
        .unwrap_or(defaults::LIST_LIMIT)
        .clamp(1, defaults::LIST_LIMIT_MAX)
}
