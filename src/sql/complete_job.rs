use indoc::formatdoc;
use sqlx::{query, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Acknowledges a finished job: releases the lock and stores the result for
/// status lookups. Terminal rows are retained until the result retention
/// window lapses, then removed by cleanup.
///
/// The `locked_by` guard makes a stale owner's acknowledgment a no-op: after
/// a lock timeout the job belongs to whichever worker re-locked it.
#[tracing::instrument(skip_all, fields(job_id = %job.id()))]
pub async fn complete_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job: &Job,
    worker_id: &str,
    result: &serde_json::Value,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.jobs as jobs
                set
                    status = 'succeeded',
                    result = $3::jsonb,
                    last_error = null,
                    locked_by = null,
                    locked_at = null,
                    updated_at = now()
                where id = $1::uuid and locked_by = $2::text;
        "#
    );

    query(&sql)
        .bind(job.id())
        .bind(worker_id)
        .bind(result)
        .execute(executor)
        .await?;

    Ok(())
}
