use std::time::Duration;

use indoc::formatdoc;
use sqlx::{query, PgExecutor};
use tracing::info;
use uuid::Uuid;

use crate::errors::Result;
use crate::job::{JobKind, QueueTier};
use crate::streams::JOBS_CHANNEL;

/// Inserts a durable job row and wakes idle workers in the same statement.
///
/// The row carries a bounded time-to-live: a job nobody dequeued before
/// `expires_at` is never delivered and is eventually removed by cleanup.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
    session_id: &str,
    kind: JobKind,
    tier: QueueTier,
    priority: i16,
    payload: &serde_json::Value,
    max_attempts: i16,
    queue_ttl: Duration,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            with new_job as (
                insert into {escaped_schema}.jobs
                    (id, session_id, kind, queue, priority, payload, max_attempts, expires_at)
                values
                    ($1, $2, $3, $4, $5, $6::jsonb, $7,
                     now() + $8::double precision * interval '1 second')
                returning id
            )
            select pg_notify('{JOBS_CHANNEL}', '') from new_job;
        "#
    );

    query(&sql)
        .bind(job_id)
        .bind(session_id)
        .bind(kind.as_str())
        .bind(tier.as_str())
        .bind(priority)
        .bind(payload)
        .bind(max_attempts)
        .bind(queue_ttl.as_secs_f64())
        .execute(executor)
        .await?;

    info!(
        %job_id,
        session_id,
        kind = %kind,
        queue = %tier,
        priority,
        "Job added to queue"
    );

    Ok(())
}
