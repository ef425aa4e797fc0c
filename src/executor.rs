use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use getset::Getters;
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::builder::WorkerOptions;
use crate::errors::RelayError;
use crate::job::{CompletionParams, EmbeddingParams, Job, JobKind};
use crate::provider::{CompletionOutcome, CompletionProvider, CompletionRequest};
use crate::rate_limiter::RateLimiter;
use crate::router::JobRouter;
use crate::session::{publish_event, SessionEvent};
use crate::shutdown::ShutdownSignal;
use crate::sql::complete_job::complete_job;
use crate::sql::fail_job::{fail_job_permanently, retry_job};
use crate::sql::get_job::get_job;
use crate::streams::{job_signal_stream, StreamSource};
use crate::worker_utils::RelayUtils;

/// The worker process that executes jobs from the queue.
///
/// Exactly one job is in flight per worker at a time (prefetch = 1): a slow
/// completion does not starve other queued jobs, since those are picked up by
/// other worker processes. Acknowledgment is late — the job row stays locked
/// until execution fully completes or definitively fails, so a crashed
/// worker's job is redelivered elsewhere once its lock times out.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// Unique identifier for this worker instance
    pub(crate) worker_id: String,
    #[getset(skip)]
    pub(crate) broker: Arc<Broker>,
    /// Schema name, pre-escaped for SQL interpolation
    pub(crate) escaped_schema: String,
    #[getset(skip)]
    pub(crate) provider: Arc<dyn CompletionProvider>,
    #[getset(skip)]
    pub(crate) limiter: RateLimiter,
    /// How often to poll for jobs when no notification arrives
    pub(crate) poll_interval: Duration,
    pub(crate) lock_timeout: Duration,
    pub(crate) rate_acquire_timeout: Duration,
    /// Soft execution budget per job
    pub(crate) task_time_limit: Duration,
    /// How long an in-flight job may keep running after shutdown is requested
    pub(crate) shutdown_grace: Duration,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_cap: Duration,
    pub(crate) retry_on_time_limit: bool,
    pub(crate) default_model: String,
    pub(crate) default_embedding_model: String,
    pub(crate) max_attempts: i16,
    pub(crate) queue_ttl: Duration,
    #[getset(skip)]
    pub(crate) shutdown_signal: ShutdownSignal,
    #[getset(skip)]
    pub(crate) shutdown_notifier: Arc<Notify>,
}

/// Errors that can occur during worker runtime.
#[derive(Error, Debug)]
pub enum WorkerRuntimeError {
    /// An error occurred while processing or releasing a job
    #[error("Unexpected error occured while processing job : '{0}'")]
    ProcessJob(#[from] ProcessJobError),

    /// Failed to subscribe to broker notifications for new jobs
    #[error("Failed to listen to broker notifications : '{0}'")]
    Listen(RelayError),
}

impl Worker {
    /// Starting point for configuring and creating a worker.
    pub fn options() -> WorkerOptions {
        WorkerOptions::default()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Runs the worker until the shutdown signal resolves.
    ///
    /// Wakes on enqueue notifications and on the poll interval, then drains
    /// available jobs one at a time. On shutdown the signal stream ends; the
    /// in-flight job gets the configured grace period before being abandoned
    /// to redelivery.
    pub async fn run(&self) -> Result<(), WorkerRuntimeError> {
        let job_signal = job_signal_stream(
            &self.broker,
            self.poll_interval,
            self.shutdown_signal.clone(),
        )
        .await
        .map_err(WorkerRuntimeError::Listen)?;
        futures::pin_mut!(job_signal);

        info!(worker_id = %self.worker_id, "Listening for jobs...");
        while let Some(source) = job_signal.next().await {
            self.drain_available(&source).await?;
        }

        info!(worker_id = %self.worker_id, "Worker stopped accepting deliveries");
        Ok(())
    }

    /// Processes every job currently available, then returns.
    pub async fn run_once(&self) -> Result<(), WorkerRuntimeError> {
        self.drain_available(&StreamSource::RunOnce).await
    }

    /// Sequential dequeue loop: one job in flight at a time, with a
    /// cooperative shutdown check between iterations.
    async fn drain_available(&self, source: &StreamSource) -> Result<(), WorkerRuntimeError> {
        loop {
            if self.shutdown_signal.peek().is_some() {
                return Ok(());
            }

            match self.process_one_job(source).await? {
                Some(job) => debug!(job_id = %job.id(), "Job processed"),
                None => return Ok(()),
            }
        }
    }

    async fn process_one_job(
        &self,
        source: &StreamSource,
    ) -> Result<Option<Job>, ProcessJobError> {
        let job = get_job(
            self.broker.pool(),
            &self.escaped_schema,
            &self.worker_id,
            self.lock_timeout,
        )
        .await
        .map_err(|e| {
            error!("Could not get job : {:?}", e);
            e
        })?;

        let Some(job) = job else {
            trace!(source = ?source, "No job found");
            return Ok(None);
        };

        let shutdown_grace = {
            let signal = self.shutdown_signal.clone();
            let grace = self.shutdown_grace;
            async move {
                signal.await;
                tokio::time::sleep(grace).await;
            }
        };

        tokio::select! {
            job_result = self.run_job(&job) => {
                self.release_job(&job, job_result).await.map_err(|e| {
                    error!("Release job error : {:?}", e);
                    e
                })?;
            }
            _ = shutdown_grace => {
                // Leave the row locked: the lock timeout hands the job to
                // another worker, exactly as if this process had crashed.
                warn!(
                    job_id = %job.id(),
                    "Job abandoned during shutdown, the broker will redeliver it"
                );
            }
        }

        Ok(Some(job))
    }

    /// Executes a single job end to end and returns its result payload.
    #[tracing::instrument(
        "run_job",
        skip(self, job),
        fields(
            job_id = %job.id(),
            session_id = %job.session_id(),
            kind = %job.kind(),
        )
    )]
    async fn run_job(&self, job: &Job) -> Result<Value, RelayError> {
        let kind = JobKind::from_str(job.kind()).map_err(RelayError::MalformedJob)?;

        let start = Instant::now();
        let result = match kind {
            JobKind::ChatCompletion => self.run_chat_job(job).await?,
            JobKind::BatchEmbeddings => self.run_embeddings_job(job).await?,
        };

        info!(
            duration = start.elapsed().as_millis() as u64,
            "Completed task with success"
        );

        Ok(result)
    }

    async fn run_chat_job(&self, job: &Job) -> Result<Value, RelayError> {
        let params: CompletionParams = serde_json::from_value(job.payload().clone())
            .map_err(|e| RelayError::MalformedJob(e.to_string()))?;
        let messages = params.conversation().map_err(RelayError::MalformedJob)?;

        self.publish(job, SessionEvent::started(*job.id())).await?;
        self.acquire_rate_token().await?;

        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let request = CompletionRequest {
            model: model.clone(),
            messages,
            stream: params.stream,
            extra: params.extra.clone(),
        };

        match tokio::time::timeout(
            self.task_time_limit,
            self.execute_completion(job, &model, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::ExecutionTimeLimit),
        }
    }

    async fn execute_completion(
        &self,
        job: &Job,
        model: &str,
        request: CompletionRequest,
    ) -> Result<Value, RelayError> {
        match self.provider.complete(request).await? {
            CompletionOutcome::Single(completion) => {
                self.publish(
                    job,
                    SessionEvent::Complete {
                        content: Some(completion.content.clone()),
                        usage: completion.usage.clone(),
                        total_chunks: None,
                    },
                )
                .await?;

                Ok(json!({
                    "session_id": job.session_id(),
                    "response": completion.content,
                    "model": model,
                    "usage": completion.usage,
                }))
            }
            CompletionOutcome::Stream(mut fragments) => {
                let mut full_response = String::new();
                let mut index = 0u32;

                while let Some(fragment) = fragments.next().await {
                    let fragment = fragment?;
                    if fragment.content.is_empty() {
                        continue;
                    }
                    index += 1;
                    full_response.push_str(&fragment.content);
                    self.publish(
                        job,
                        SessionEvent::Chunk {
                            content: fragment.content,
                            index,
                        },
                    )
                    .await?;
                }

                self.publish(
                    job,
                    SessionEvent::Complete {
                        content: None,
                        usage: None,
                        total_chunks: Some(index),
                    },
                )
                .await?;

                info!(
                    chars = full_response.len(),
                    chunks = index,
                    "Streaming completion finished"
                );

                Ok(json!({
                    "session_id": job.session_id(),
                    "response": full_response,
                    "model": model,
                    "chunks": index,
                }))
            }
        }
    }

    async fn run_embeddings_job(&self, job: &Job) -> Result<Value, RelayError> {
        let params: EmbeddingParams = serde_json::from_value(job.payload().clone())
            .map_err(|e| RelayError::MalformedJob(e.to_string()))?;
        if params.texts.is_empty() {
            return Err(RelayError::MalformedJob("'texts' must not be empty".into()));
        }

        self.publish(job, SessionEvent::started(*job.id())).await?;
        self.acquire_rate_token().await?;

        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.default_embedding_model.clone());

        let embeddings = match tokio::time::timeout(
            self.task_time_limit,
            self.provider.embed(&model, &params.texts),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RelayError::ExecutionTimeLimit),
        };

        let count = embeddings.vectors.len();
        let dimensions = embeddings.vectors.first().map(Vec::len).unwrap_or(0);

        self.publish(
            job,
            SessionEvent::Complete {
                content: None,
                usage: None,
                total_chunks: None,
            },
        )
        .await?;

        Ok(json!({
            "embeddings": embeddings.vectors,
            "model": embeddings.model,
            "count": count,
            "dimensions": dimensions,
        }))
    }

    async fn acquire_rate_token(&self) -> Result<(), RelayError> {
        let granted = self
            .limiter
            .acquire(1.0, self.rate_acquire_timeout)
            .await?;
        if granted {
            Ok(())
        } else {
            Err(RelayError::RateLimitTimeout {
                resource: self.limiter.key().to_string(),
                timeout: self.rate_acquire_timeout,
            })
        }
    }

    async fn publish(&self, job: &Job, event: SessionEvent) -> Result<(), RelayError> {
        publish_event(&self.broker, job.session_id(), &event).await
    }

    /// Acknowledges or rejects the delivery based on the execution result.
    ///
    /// This is the failure handler that guarantees a terminal event for every
    /// job that reached `started`: any error that is not retried publishes
    /// `error` on the session channel. Malformed payloads are the one
    /// exception — rejected without requeue and only logged, since nothing
    /// trustworthy can be published for them.
    async fn release_job(
        &self,
        job: &Job,
        job_result: Result<Value, RelayError>,
    ) -> Result<(), ReleaseJobError> {
        let error = match job_result {
            Ok(result) => {
                complete_job(
                    self.broker.pool(),
                    &self.escaped_schema,
                    job,
                    &self.worker_id,
                    &result,
                )
                .await
                .map_err(|e| ReleaseJobError {
                    job_id: *job.id(),
                    source: e,
                })?;
                return Ok(());
            }
            Err(e) => e,
        };

        let error_str = error.to_string();
        let retryable = match &error {
            // Nothing about a malformed payload changes on redelivery.
            RelayError::MalformedJob(_) => false,
            RelayError::ExecutionTimeLimit => self.retry_on_time_limit,
            _ => true,
        };

        if retryable && job.has_attempts_left() {
            let delay = retry_delay(*job.attempts(), self.backoff_base, self.backoff_cap);
            warn!(
                error = %error_str,
                job_id = %job.id(),
                attempts = job.attempts(),
                max_attempts = job.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Failed job, will retry"
            );

            retry_job(
                self.broker.pool(),
                &self.escaped_schema,
                job,
                &self.worker_id,
                &error_str,
                delay,
            )
            .await
            .map_err(|e| ReleaseJobError {
                job_id: *job.id(),
                source: e,
            })?;

            return Ok(());
        }

        error!(
            error = %error_str,
            job_id = %job.id(),
            attempts = job.attempts(),
            "Job permanently failed"
        );

        fail_job_permanently(
            self.broker.pool(),
            &self.escaped_schema,
            job,
            &self.worker_id,
            &error_str,
        )
        .await
        .map_err(|e| ReleaseJobError {
            job_id: *job.id(),
            source: e,
        })?;

        if !matches!(error, RelayError::MalformedJob(_)) {
            let terminal = SessionEvent::Error { error: error_str };
            if let Err(e) = publish_event(&self.broker, job.session_id(), &terminal).await {
                warn!(
                    error = %e,
                    job_id = %job.id(),
                    "Could not publish terminal error event"
                );
            }
        }

        Ok(())
    }

    /// Creates a router sharing this worker's broker connection.
    pub fn create_router(&self) -> JobRouter {
        JobRouter::new(
            self.broker.clone(),
            self.escaped_schema.clone(),
            self.max_attempts,
            self.queue_ttl,
        )
    }

    /// Creates a utils object for status lookups and maintenance.
    pub fn create_utils(&self) -> RelayUtils {
        RelayUtils::new(self.broker.pool().clone(), self.escaped_schema.clone())
    }

    /// Requests a graceful shutdown: the worker stops accepting deliveries
    /// once the current job finishes or the grace period elapses.
    pub fn request_shutdown(&self) {
        self.shutdown_notifier.notify_waiters();
    }
}

/// Errors that can occur while processing a job.
#[derive(Error, Debug)]
pub enum ProcessJobError {
    /// Error occurred when trying to complete or fail a job after processing
    #[error("An error occured while releasing a job : '{0}'")]
    ReleaseJobError(#[from] ReleaseJobError),

    /// Error occurred when trying to fetch a job from the queue
    #[error("An error occured while fetching a job to run : '{0}'")]
    GetJobError(#[from] RelayError),
}

/// Error that occurs when trying to mark a job as completed or failed.
#[derive(Error, Debug)]
#[error("Failed to release job '{job_id}'. {source}")]
pub struct ReleaseJobError {
    job_id: Uuid,
    #[source]
    source: RelayError,
}

/// Exponential backoff with full jitter: the delay doubles with each
/// attempt, is capped, and the actual wait is drawn uniformly from
/// `[0, capped_delay]` to avoid synchronized retry storms.
fn retry_delay(attempt: i16, base: Duration, cap: Duration) -> Duration {
    let attempt = attempt.max(1) as i32;
    let exponential = base.as_secs_f64() * 2f64.powi(attempt - 1);
    let bounded = exponential.min(cap.as_secs_f64());
    let jittered = rand::thread_rng().gen_range(0.0..=bounded);
    Duration::from_secs_f64(jittered)
}
