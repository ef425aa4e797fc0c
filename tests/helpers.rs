#![allow(dead_code)]

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, Future, FutureExt};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use llm_relay::builder::WorkerOptions;
use llm_relay::broker::Broker;
use llm_relay::config::RelayConfig;
use llm_relay::executor::Worker;
use llm_relay::migrations::migrate;
use llm_relay::provider::{
    Completion, CompletionOutcome, CompletionProvider, CompletionRequest, Embeddings, Fragment,
    ProviderError, Usage,
};
use llm_relay::router::JobRouter;
use llm_relay::worker_utils::RelayUtils;

/// Schema every test database uses. A plain identifier, so the escaped form
/// is identical.
pub const SCHEMA: &str = "llm_relay";

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::new(Broker::from_pool(self.test_pool.clone()))
    }

    pub async fn migrate(&self) {
        migrate(&self.test_pool, SCHEMA)
            .await
            .expect("Failed to migrate test database");
    }

    pub fn router(&self) -> JobRouter {
        let config = test_config();
        JobRouter::new(self.broker(), SCHEMA, config.max_attempts, config.queue_ttl)
    }

    pub fn utils(&self) -> RelayUtils {
        RelayUtils::new(self.test_pool.clone(), SCHEMA)
    }

    pub fn worker_options(&self, provider: Arc<dyn CompletionProvider>) -> WorkerOptions {
        Worker::options()
            .pg_pool(self.test_pool.clone())
            .config(test_config())
            .schema(SCHEMA)
            .provider(provider)
    }

    pub async fn get_jobs(&self) -> Vec<JobRow> {
        sqlx::query_as(&format!(
            "select * from {SCHEMA}.jobs order by created_at asc, id asc"
        ))
        .fetch_all(&self.test_pool)
        .await
        .expect("Failed to get jobs")
    }

    pub async fn get_job_row(&self, id: Uuid) -> JobRow {
        sqlx::query_as(&format!("select * from {SCHEMA}.jobs where id = $1"))
            .bind(id)
            .fetch_one(&self.test_pool)
            .await
            .expect("Failed to get job row")
    }
}

/// Raw view of a job row for assertions.
#[derive(FromRow, Debug)]
pub struct JobRow {
    pub id: Uuid,
    pub session_id: String,
    pub kind: String,
    pub queue: String,
    pub priority: i16,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i16,
    pub max_attempts: i16,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub run_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

/// Fast-feedback tuning for tests; the broker URL is irrelevant because
/// every test injects its own pool.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        rate_capacity: 1000.0,
        rate_period: Duration::from_secs(60),
        rate_acquire_timeout: Duration::from_millis(500),
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        task_time_limit: Duration::from_secs(30),
        poll_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(500),
        ..RelayConfig::default()
    }
}

async fn create_test_database() -> TestDatabase {
    let source_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must point at a postgres server for integration tests");

    let source_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&source_url)
        .await
        .expect("Failed to connect to source database");

    let name = format!("llm_relay_test_{}", Uuid::new_v4().simple());
    sqlx::query(&format!("CREATE DATABASE {name}"))
        .execute(&source_pool)
        .await
        .expect("Failed to create test database");

    let options: PgConnectOptions = source_url
        .parse::<PgConnectOptions>()
        .expect("Invalid DATABASE_URL")
        .database(&name);

    let test_pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool,
        test_pool,
        name,
    }
}

/// Runs a test against a disposable database, dropping it afterwards even if
/// the test panics.
pub async fn with_test_db<F, Fut>(f: F)
where
    F: FnOnce(TestDatabase) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();

    let test_db = create_test_database().await;
    let result = AssertUnwindSafe(f(test_db.clone())).catch_unwind().await;
    test_db.drop().await;

    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .ok();
}

/// One scripted provider response, consumed per completion call.
pub enum ProviderResponse {
    /// A streamed completion yielding these fragments in order
    Stream(Vec<&'static str>),
    /// A single non-streamed completion
    Single(&'static str),
    /// A transport failure
    Error(&'static str),
}

/// Provider double that replays a script and records every request.
pub struct FakeProvider {
    script: Mutex<VecDeque<ProviderResponse>>,
    pub seen: Mutex<Vec<CompletionRequest>>,
}

impl FakeProvider {
    pub fn scripted(script: Vec<ProviderResponse>) -> Arc<Self> {
        Arc::new(FakeProvider {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn streaming(fragments: Vec<&'static str>) -> Arc<Self> {
        Self::scripted(vec![ProviderResponse::Stream(fragments)])
    }
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionOutcome, ProviderError> {
        self.seen.lock().unwrap().push(request);

        match self.script.lock().unwrap().pop_front() {
            Some(ProviderResponse::Stream(fragments)) => {
                let fragments: Vec<_> = fragments
                    .into_iter()
                    .map(|content| {
                        Ok(Fragment {
                            content: content.to_string(),
                        })
                    })
                    .collect();
                Ok(CompletionOutcome::Stream(Box::pin(stream::iter(fragments))))
            }
            Some(ProviderResponse::Single(content)) => {
                Ok(CompletionOutcome::Single(Completion {
                    content: content.to_string(),
                    usage: Some(Usage {
                        prompt_tokens: 3,
                        completion_tokens: 5,
                        total_tokens: 8,
                    }),
                }))
            }
            Some(ProviderResponse::Error(message)) => {
                Err(ProviderError::Transport(message.to_string()))
            }
            None => Err(ProviderError::Transport("provider script exhausted".into())),
        }
    }

    async fn embed(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Embeddings, ProviderError> {
        Ok(Embeddings {
            model: model.to_string(),
            vectors: texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect(),
        })
    }
}
