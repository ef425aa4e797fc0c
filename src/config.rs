use std::env;
use std::time::Duration;

use thiserror::Error;

/// Environment-sourced configuration for the relay.
///
/// Loaded once at process start and passed by value to the components that
/// need it. Every field is a pass-through value; none of the core logic
/// depends on how configuration is obtained.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// PostgreSQL connection URL (broker, rate bucket store and session channels)
    pub database_url: String,
    /// Schema holding the relay's tables
    pub schema: String,
    /// Tokens added to the rate bucket per period (requests per minute upstream)
    pub rate_capacity: f64,
    /// Length of the refill period
    pub rate_period: Duration,
    /// How long a worker waits for a rate token before failing the attempt
    pub rate_acquire_timeout: Duration,
    /// Resource name keying the shared rate bucket
    pub rate_key: String,
    /// Total delivery attempts before a job is permanently failed
    pub max_attempts: i16,
    /// First retry delay; doubled on every subsequent attempt
    pub backoff_base: Duration,
    /// Ceiling for the retry delay
    pub backoff_cap: Duration,
    /// Whether an execution time limit counts against the retry budget
    /// instead of failing the job outright
    pub retry_on_time_limit: bool,
    /// Model substituted when a job omits one
    pub default_model: String,
    /// Embeddings model substituted when a job omits one
    pub default_embedding_model: String,
    /// Soft per-job execution budget
    pub task_time_limit: Duration,
    /// How long an undelivered job may sit in its queue before expiring
    pub queue_ttl: Duration,
    /// How long terminal results are retained for status lookups
    pub result_ttl: Duration,
    /// After this long without completion, a started job's lock is considered
    /// abandoned and the job becomes eligible for redelivery
    pub lock_timeout: Duration,
    /// How often an idle worker polls for jobs (notifications wake it sooner)
    pub poll_interval: Duration,
    /// Grace period granted to an in-flight job once shutdown is requested
    pub shutdown_grace: Duration,
    /// Base URL of the OpenAI-compatible provider
    pub provider_base_url: String,
    /// API key for the provider
    pub provider_api_key: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            schema: "llm_relay".into(),
            rate_capacity: 500.0,
            rate_period: Duration::from_secs(60),
            rate_acquire_timeout: Duration::from_secs(30),
            rate_key: "openai".into(),
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            retry_on_time_limit: false,
            default_model: "gpt-4o-mini".into(),
            default_embedding_model: "text-embedding-3-small".into(),
            task_time_limit: Duration::from_secs(270),
            queue_ttl: Duration::from_secs(300),
            result_ttl: Duration::from_secs(3600),
            lock_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(5),
            provider_base_url: "https://api.openai.com/v1".into(),
            provider_api_key: String::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable '{0}'")]
    MissingVar(&'static str),

    #[error("Environment variable '{name}' has invalid value '{value}'")]
    InvalidVar { name: &'static str, value: String },
}

impl RelayConfig {
    /// Loads the configuration from the process environment, reading a
    /// `.env` file first when one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            schema: optional("RELAY_SCHEMA").unwrap_or(defaults.schema),
            rate_capacity: parsed("LLM_RPM", defaults.rate_capacity)?,
            rate_period: secs("LLM_RATE_PERIOD_SECS", defaults.rate_period)?,
            rate_acquire_timeout: secs(
                "LLM_RATE_ACQUIRE_TIMEOUT_SECS",
                defaults.rate_acquire_timeout,
            )?,
            rate_key: optional("LLM_RATE_KEY").unwrap_or(defaults.rate_key),
            max_attempts: parsed("LLM_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: secs("LLM_BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_cap: secs("LLM_BACKOFF_CAP_SECS", defaults.backoff_cap)?,
            retry_on_time_limit: parsed("LLM_RETRY_ON_TIME_LIMIT", defaults.retry_on_time_limit)?,
            default_model: optional("LLM_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            default_embedding_model: optional("LLM_DEFAULT_EMBEDDING_MODEL")
                .unwrap_or(defaults.default_embedding_model),
            task_time_limit: secs("LLM_TASK_TIME_LIMIT_SECS", defaults.task_time_limit)?,
            queue_ttl: secs("LLM_QUEUE_TTL_SECS", defaults.queue_ttl)?,
            result_ttl: secs("LLM_RESULT_TTL_SECS", defaults.result_ttl)?,
            lock_timeout: secs("LLM_LOCK_TIMEOUT_SECS", defaults.lock_timeout)?,
            poll_interval: Duration::from_millis(parsed(
                "LLM_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            shutdown_grace: secs("LLM_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            provider_base_url: optional("OPENAI_BASE_URL").unwrap_or(defaults.provider_base_url),
            provider_api_key: optional("OPENAI_API_KEY").unwrap_or_default(),
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingVar(name))
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value }),
    }
}

fn secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parsed(name, default.as_secs())?))
}
