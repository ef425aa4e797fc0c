use std::time::Duration;

use indoc::formatdoc;
use sqlx::{query, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Requeues a failed job for another delivery after `delay`.
///
/// The lock is released and the row returns to `retrying`, so any worker may
/// pick it up once `run_at` passes. Guarded by `locked_by` like
/// acknowledgment: a stale owner cannot requeue a job it no longer holds.
pub async fn retry_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job: &Job,
    worker_id: &str,
    message: &str,
    delay: Duration,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.jobs as jobs
                set
                    status = 'retrying',
                    last_error = $3::text,
                    run_at = greatest(now(), run_at) + $4::double precision * interval '1 second',
                    locked_by = null,
                    locked_at = null,
                    updated_at = now()
                where id = $1::uuid and locked_by = $2::text;
        "#
    );

    query(&sql)
        .bind(job.id())
        .bind(worker_id)
        .bind(message)
        .bind(delay.as_secs_f64())
        .execute(executor)
        .await?;

    Ok(())
}

/// Rejects a job without requeue: the terminal state for exhausted retry
/// budgets, unrecoverable errors and malformed payloads. Prevents infinite
/// redelivery loops.
pub async fn fail_job_permanently(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job: &Job,
    worker_id: &str,
    message: &str,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.jobs as jobs
                set
                    status = 'failed',
                    last_error = $3::text,
                    locked_by = null,
                    locked_at = null,
                    updated_at = now()
                where id = $1::uuid and locked_by = $2::text;
        "#
    );

    query(&sql)
        .bind(job.id())
        .bind(worker_id)
        .bind(message)
        .execute(executor)
        .await?;

    Ok(())
}
