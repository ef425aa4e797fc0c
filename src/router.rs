use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::broker::Broker;
use crate::errors::{RelayError, Result};
use crate::job::{CompletionParams, EmbeddingParams, JobKind, QueueTier, PRIORITY_BOUND};
use crate::session::validate_session_id;
use crate::sql::enqueue_job::enqueue_job;

/// Largest accepted embeddings batch.
pub const MAX_EMBEDDING_BATCH: usize = 100;

/// A chat completion submission, as received from the façade.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    /// Caller-supplied session identifier; generated when absent
    #[serde(default)]
    pub session_id: Option<String>,
    pub params: CompletionParams,
    /// -10 (low) to 10 (high); clamped
    #[serde(default)]
    pub priority: i16,
}

/// A batch embeddings submission.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub params: EmbeddingParams,
    #[serde(default)]
    pub priority: i16,
}

/// What the caller gets back immediately after a successful enqueue.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: Uuid,
    pub session_id: String,
    pub queue: QueueTier,
}

/// Maps inbound jobs to a destination queue and enqueues them durably.
///
/// Submission returns as soon as the broker accepted the row; execution is
/// entirely decoupled. A broker failure here surfaces to the caller as a
/// service-unavailable condition rather than being silently dropped.
pub struct JobRouter {
    broker: Arc<Broker>,
    escaped_schema: String,
    max_attempts: i16,
    queue_ttl: Duration,
}

impl JobRouter {
    pub fn new(
        broker: Arc<Broker>,
        escaped_schema: impl Into<String>,
        max_attempts: i16,
        queue_ttl: Duration,
    ) -> Self {
        JobRouter {
            broker,
            escaped_schema: escaped_schema.into(),
            max_attempts,
            queue_ttl,
        }
    }

    /// Validates the typed core, routes by priority and enqueues the job.
    /// Returns the task identifier immediately; does not wait for execution.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        // Core validation only: a payload that cannot produce a conversation
        // would otherwise be rejected by a worker with no way to report it.
        request
            .params
            .conversation()
            .map_err(RelayError::MalformedJob)?;

        let payload = serde_json::to_value(&request.params)?;
        self.enqueue(
            JobKind::ChatCompletion,
            request.session_id,
            request.priority,
            payload,
            self.max_attempts,
        )
        .await
    }

    /// Enqueues a batch embeddings job. Embeddings are retried once at most,
    /// so a flaky batch does not churn through the full retry budget.
    pub async fn submit_embeddings(&self, request: EmbeddingsRequest) -> Result<Submission> {
        if request.params.texts.is_empty() {
            return Err(RelayError::MalformedJob("'texts' must not be empty".into()));
        }
        if request.params.texts.len() > MAX_EMBEDDING_BATCH {
            return Err(RelayError::MalformedJob(format!(
                "at most {MAX_EMBEDDING_BATCH} texts per request"
            )));
        }

        let payload = serde_json::to_value(&request.params)?;
        self.enqueue(
            JobKind::BatchEmbeddings,
            request.session_id,
            request.priority,
            payload,
            2,
        )
        .await
    }

    async fn enqueue(
        &self,
        kind: JobKind,
        session_id: Option<String>,
        priority: i16,
        payload: serde_json::Value,
        max_attempts: i16,
    ) -> Result<Submission> {
        let session_id = match session_id {
            Some(session_id) => {
                validate_session_id(&session_id).map_err(RelayError::MalformedJob)?;
                session_id
            }
            None => Uuid::new_v4().to_string(),
        };

        let priority = priority.clamp(-PRIORITY_BOUND, PRIORITY_BOUND);
        let queue = QueueTier::from_priority(priority);
        let task_id = Uuid::new_v4();

        enqueue_job(
            self.broker.pool(),
            &self.escaped_schema,
            task_id,
            &session_id,
            kind,
            queue,
            priority,
            &payload,
            max_attempts,
            self.queue_ttl,
        )
        .await?;

        Ok(Submission {
            task_id,
            session_id,
            queue,
        })
    }
}
