//! Environment-driven configuration.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file. Anything unset falls back to its default; anything set but
//! unparseable is an error rather than a silent default.

use std::str::FromStr;
use std::time::Duration;

use demandflow_llm::ProviderEndpoint;

use crate::queue::QueueSettings;
use crate::reconcile::ReconcileSettings;
use crate::retry::RetryPolicy;
use crate::worker::{WorkerPoolConfig, WorkerSettings};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// LLM provider endpoints.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub openai: ProviderEndpoint,
    pub gemini: ProviderEndpoint,
    /// Transport-level timeout for one HTTP request
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub queues: QueueSettings,
    pub pool: WorkerPoolConfig,
    pub worker: WorkerSettings,
    pub dispatch_retry: RetryPolicy,
    pub reconcile: ReconcileSettings,
    pub providers: ProviderSettings,
}

impl AppConfig {
    /// Load `.env` (if present), then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.string("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = env.string_or("REDIS_URL", "redis://127.0.0.1:6379");

        let queues = QueueSettings {
            task_stream: env.string_or("TASK_STREAM", "demandflow:tasks"),
            notification_stream: env.string_or("NOTIFICATION_STREAM", "demandflow:notifications"),
            group: env.string_or("WORKER_GROUP", "demandflow.workers"),
            visibility_timeout: Duration::from_millis(
                env.parse_or("QUEUE_VISIBILITY_TIMEOUT_MS", 900_000u64)?,
            ),
            max_deliveries: env.parse_or("QUEUE_MAX_DELIVERIES", 10u32)?,
        };

        let consumers: usize = env.parse_or("WORKER_CONCURRENCY", 4)?;
        if consumers == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        let pool = WorkerPoolConfig::default()
            .with_consumers(consumers)
            .with_name_prefix(env.string_or("WORKER_NAME", "worker"));

        let llm_retry = RetryPolicy {
            max_attempts: env.parse_or("LLM_MAX_ATTEMPTS", 5)?,
            base_delay: Duration::from_millis(env.parse_or("LLM_BASE_DELAY_MS", 2_000)?),
            max_delay: Duration::from_millis(env.parse_or("LLM_MAX_DELAY_MS", 60_000)?),
            multiplier: env.parse_or("LLM_BACKOFF_MULTIPLIER", 2.0)?,
            jitter: env.parse_or("LLM_JITTER", 0.2)?,
        };
        if llm_retry.max_attempts == 0 {
            return Err(invalid("LLM_MAX_ATTEMPTS", "must be at least 1"));
        }
        if llm_retry.multiplier < 1.0 {
            return Err(invalid("LLM_BACKOFF_MULTIPLIER", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&llm_retry.jitter) {
            return Err(invalid("LLM_JITTER", "must be within 0.0..=1.0"));
        }


        let dispatch_retry = RetryPolicy::exponential(
            env.parse_or("ENQUEUE_MAX_ATTEMPTS", 3)?,
            Duration::from_millis(200),
            Duration::from_secs(2),
        );

        let reconcile = ReconcileSettings {
            interval: Duration::from_secs(env.parse_or("RECONCILE_INTERVAL_SECS", 60)?),
            orphan_after: Duration::from_secs(env.parse_or("ORPHAN_AFTER_SECS", 3_600)?),
            stall_after: Duration::from_secs(env.parse_or("STALL_AFTER_SECS", 1_800)?),
            notify_grace: Duration::from_secs(env.parse_or("NOTIFY_GRACE_SECS", 300)?),
            ..ReconcileSettings::default()
        };
        if reconcile.interval.is_zero() {
            return Err(invalid("RECONCILE_INTERVAL_SECS", "must be at least 1"));
        }

        let worker = WorkerSettings {
            llm_retry,
            attempt_timeout: Duration::from_secs(env.parse_or("LLM_ATTEMPT_TIMEOUT_SECS", 120)?),
            notify_lease: reconcile.notify_grace,
            ..WorkerSettings::default()
        };

        // A delivery must not be re-claimed, nor its request failed as stalled,
        // while a live worker can still be processing it.
        let max_processing = worker.max_processing_time();
        if queues.visibility_timeout <= max_processing {
            return Err(invalid(
                "QUEUE_VISIBILITY_TIMEOUT_MS",
                format!(
                    "{}ms must exceed the longest processing time of {}ms",
                    queues.visibility_timeout.as_millis(),
                    max_processing.as_millis()
                ),
            ));
        }
        if reconcile.stall_after <= max_processing {
            return Err(invalid(
                "STALL_AFTER_SECS",
                format!(
                    "{}s must exceed the longest processing time of {}s",
                    reconcile.stall_after.as_secs(),
                    max_processing.as_secs()
                ),
            ));
        }

        let providers = ProviderSettings {
            openai: endpoint(
                &env,
                "OPENAI_API_KEY",
                env.string_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                env.string_or("OPENAI_MODEL", "gpt-3.5-turbo-0125"),
            ),
            gemini: endpoint(
                &env,
                "GEMINI_API_KEY",
                env.string_or(
                    "GEMINI_BASE_URL",
                    "https://generativelanguage.googleapis.com/v1beta/openai",
                ),
                env.string_or("GEMINI_MODEL", "gemini-pro"),
            ),
            request_timeout: Duration::from_secs(env.parse_or("LLM_HTTP_TIMEOUT_SECS", 150)?),
        };

        Ok(Self {
            database_url,
            redis_url,
            queues,
            pool,
            worker,
            dispatch_retry,
            reconcile,
            providers,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| invalid(key, format!("{raw:?}: {e}"))),
        }
    }
}

fn endpoint<F>(env: &Env<F>, key_var: &str, base_url: String, model: String) -> ProviderEndpoint
where
    F: Fn(&str) -> Option<String>,
{
    let endpoint = ProviderEndpoint::new(base_url, model);
    match env.string(key_var) {
        Some(key) => endpoint.with_api_key(key),
        None => endpoint,
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
