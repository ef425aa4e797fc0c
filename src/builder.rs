use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Notify;

use crate::broker::Broker;
use crate::config::{ConfigError, RelayConfig};
use crate::errors::RelayError;
use crate::executor::Worker;
use crate::migrations::migrate;
use crate::provider::CompletionProvider;
use crate::rate_limiter::RateLimiter;
use crate::shutdown::shutdown_signal;
use crate::utils::escape_identifier;

/// Configuration options for initializing a worker instance.
///
/// Builder-style API: connection settings and tuning knobs default to the
/// environment-sourced [`RelayConfig`], with explicit overrides for tests
/// and embedding applications.
#[derive(Default)]
pub struct WorkerOptions {
    /// Tuning knobs; loaded from the environment when not supplied
    config: Option<RelayConfig>,

    /// Existing connection pool to reuse instead of connecting
    pg_pool: Option<PgPool>,

    /// Maximum number of broker connections in the pool
    max_pg_conn: Option<u32>,

    /// Schema override
    schema: Option<String>,

    /// Poll interval override
    poll_interval: Option<Duration>,

    /// The completion provider jobs are executed against
    provider: Option<Arc<dyn CompletionProvider>>,
}

/// Errors that can occur when initializing a worker.
#[derive(Error, Debug)]
pub enum WorkerBuildError {
    /// The environment-sourced configuration could not be loaded
    #[error("Error occurred while loading configuration: {0}")]
    Config(#[from] ConfigError),

    /// Failed to connect to the broker
    #[error("Error occurred while connecting to the broker: {0}")]
    ConnectError(RelayError),

    /// Failed while executing a query during initialization
    #[error("Error occurred while executing a query: {0}")]
    QueryError(RelayError),

    /// No connection information was supplied
    #[error("Missing database_url configuration - must provide either database_url or pg_pool")]
    MissingDatabaseUrl,

    /// No completion provider was supplied
    #[error("Missing provider - a worker cannot execute jobs without one")]
    MissingProvider,
}

impl WorkerOptions {
    /// Initializes a worker with the configured options.
    ///
    /// Establishes the connection pool (or reuses the provided one), applies
    /// pending migrations, and assembles the worker with a random identity.
    /// The broker handle, rate limiter and shutdown signal are all owned by
    /// the returned worker; nothing global is initialized.
    pub async fn init(self) -> Result<Worker, WorkerBuildError> {
        let config = match self.config {
            Some(config) => config,
            None => RelayConfig::from_env()?,
        };

        let provider = self.provider.ok_or(WorkerBuildError::MissingProvider)?;

        let pool = match self.pg_pool {
            Some(pool) => pool,
            None => {
                if config.database_url.is_empty() {
                    return Err(WorkerBuildError::MissingDatabaseUrl);
                }

                PgPoolOptions::new()
                    .max_connections(self.max_pg_conn.unwrap_or(10))
                    .connect(&config.database_url)
                    .await
                    .map_err(|e| {
                        WorkerBuildError::ConnectError(RelayError::BrokerUnavailable(e))
                    })?
            }
        };

        let schema = self.schema.unwrap_or_else(|| config.schema.clone());
        let escaped_schema = escape_identifier(&pool, &schema)
            .await
            .map_err(WorkerBuildError::QueryError)?;

        migrate(&pool, &escaped_schema)
            .await
            .map_err(WorkerBuildError::QueryError)?;

        let broker = Arc::new(Broker::from_pool(pool));
        let limiter = RateLimiter::new(
            broker.clone(),
            escaped_schema.clone(),
            format!("ratelimit:{}", config.rate_key),
            config.rate_capacity,
            config.rate_period,
        );

        let shutdown_notifier = Arc::new(Notify::new());

        let worker = Worker {
            worker_id: format!("llm_relay_worker_{:016x}", rand::thread_rng().gen::<u64>()),
            broker,
            escaped_schema,
            provider,
            limiter,
            poll_interval: self.poll_interval.unwrap_or(config.poll_interval),
            lock_timeout: config.lock_timeout,
            rate_acquire_timeout: config.rate_acquire_timeout,
            task_time_limit: config.task_time_limit,
            shutdown_grace: config.shutdown_grace,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            retry_on_time_limit: config.retry_on_time_limit,
            default_model: config.default_model,
            default_embedding_model: config.default_embedding_model,
            max_attempts: config.max_attempts,
            queue_ttl: config.queue_ttl,
            shutdown_signal: shutdown_signal(shutdown_notifier.clone()),
            shutdown_notifier,
        };

        Ok(worker)
    }

    pub fn config(mut self, value: RelayConfig) -> Self {
        self.config = Some(value);
        self
    }

    pub fn pg_pool(mut self, value: PgPool) -> Self {
        self.pg_pool = Some(value);
        self
    }

    pub fn max_pg_conn(mut self, value: u32) -> Self {
        self.max_pg_conn = Some(value);
        self
    }

    pub fn schema(mut self, value: &str) -> Self {
        self.schema = Some(value.into());
        self
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    pub fn provider(mut self, value: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(value);
        self
    }
}
