use std::time::Duration;

use indoc::formatdoc;
use sqlx::{query_as, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Locks and returns the next deliverable job, or `None` when every queue is
/// drained.
///
/// Selection order: tier rank (high before default before low), then
/// priority descending within the tier, then submission order. Rows are
/// taken with `for update skip locked`, so concurrent workers never receive
/// the same delivery.
///
/// A `started` row whose lock is older than `lock_timeout` belonged to a
/// crashed worker; it is redelivered here exactly like a queued one, as long
/// as its retry budget is not exhausted.
pub async fn get_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    worker_id: &str,
    lock_timeout: Duration,
) -> Result<Option<Job>> {
    let sql = formatdoc!(
        r#"
            with next_job as (
                select jobs.id
                    from {escaped_schema}.jobs as jobs
                    where (
                        (jobs.status in ('queued', 'retrying') and jobs.run_at <= now())
                        or (
                            jobs.status = 'started'
                            and jobs.locked_at < now() - $2::double precision * interval '1 second'
                        )
                    )
                    and jobs.expires_at > now()
                    and jobs.attempts < jobs.max_attempts
                    order by
                        case jobs.queue
                            when 'high' then 0
                            when 'default' then 1
                            else 2
                        end asc,
                        jobs.priority desc,
                        jobs.run_at asc
                    limit 1
                    for update
                    skip locked
            )
            update {escaped_schema}.jobs as jobs
                set
                    status = 'started',
                    attempts = jobs.attempts + 1,
                    locked_by = $1::text,
                    locked_at = now(),
                    updated_at = now()
                from next_job
                where jobs.id = next_job.id
                returning jobs.*
        "#
    );

    let job = query_as(&sql)
        .bind(worker_id)
        .bind(lock_timeout.as_secs_f64())
        .fetch_optional(executor)
        .await?;

    Ok(job)
}
