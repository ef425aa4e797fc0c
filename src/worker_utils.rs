use std::time::Duration;

use indoc::formatdoc;
use sqlx::{query, query_as, FromRow, PgExecutor, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::errors::Result;
use crate::job::QueueTier;
use crate::sql::task_status::{task_status, TaskStatus};

/// Maintenance tasks that keep the queue tables bounded over time.
///
/// None of these are load-bearing for correctness — expired and stale rows
/// are already filtered out of every query — they only reclaim space.
#[derive(Debug, Clone, Copy)]
pub enum CleanupTask {
    /// Removes undelivered jobs whose message time-to-live has lapsed.
    ExpiredJobs,

    /// Removes terminal jobs once their results fall out of the retention
    /// window for status lookups.
    ExpiredResults { retention: Duration },

    /// Removes rate buckets nobody has touched for a while; they are
    /// recreated full on the next acquire.
    StaleRateBuckets { retention: Duration },

    /// Returns jobs locked by crashed workers to the queue ahead of their
    /// natural lock-timeout redelivery.
    ReleaseAbandonedLocks { lock_timeout: Duration },
}

impl CleanupTask {
    /// Executes the cleanup task, returning the number of rows affected.
    pub async fn execute<'e>(
        &self,
        executor: impl PgExecutor<'e>,
        escaped_schema: &str,
    ) -> Result<u64> {
        let affected = match self {
            CleanupTask::ExpiredJobs => {
                let sql = formatdoc!(
                    r#"
                        delete from {escaped_schema}.jobs as jobs
                            where status in ('queued', 'retrying')
                            and expires_at <= now();
                    "#
                );

                query(&sql).execute(executor).await?.rows_affected()
            }
            CleanupTask::ExpiredResults { retention } => {
                let sql = formatdoc!(
                    r#"
                        delete from {escaped_schema}.jobs as jobs
                            where status in ('succeeded', 'failed')
                            and updated_at < now() - $1::double precision * interval '1 second';
                    "#
                );

                query(&sql)
                    .bind(retention.as_secs_f64())
                    .execute(executor)
                    .await?
                    .rows_affected()
            }
            CleanupTask::StaleRateBuckets { retention } => {
                let sql = formatdoc!(
                    r#"
                        delete from {escaped_schema}.rate_buckets
                            where updated_at < now() - $1::double precision * interval '1 second';
                    "#
                );

                query(&sql)
                    .bind(retention.as_secs_f64())
                    .execute(executor)
                    .await?
                    .rows_affected()
            }
            CleanupTask::ReleaseAbandonedLocks { lock_timeout } => {
                let sql = formatdoc!(
                    r#"
                        update {escaped_schema}.jobs as jobs
                            set status = 'retrying', locked_by = null, locked_at = null,
                                updated_at = now()
                            where status = 'started'
                            and locked_at < now() - $1::double precision * interval '1 second';
                    "#
                );

                query(&sql)
                    .bind(lock_timeout.as_secs_f64())
                    .execute(executor)
                    .await?
                    .rows_affected()
            }
        };

        Ok(affected)
    }
}

/// Pending job count for one queue tier.
#[derive(FromRow, Debug, Clone)]
pub struct QueueDepth {
    pub queue: String,
    pub pending: i64,
}

/// Utility methods for status lookups and queue maintenance, used by the
/// façade's status and stats endpoints.
pub struct RelayUtils {
    pool: PgPool,
    escaped_schema: String,
}

impl RelayUtils {
    pub fn new(pool: PgPool, escaped_schema: impl Into<String>) -> Self {
        RelayUtils {
            pool,
            escaped_schema: escaped_schema.into(),
        }
    }

    /// Looks up a job by identifier: current status, plus result payload or
    /// error string once terminal.
    pub async fn task_status(&self, task_id: Uuid) -> Result<Option<TaskStatus>> {
        task_status(&self.pool, &self.escaped_schema, task_id).await
    }

    /// Per-tier pending job counts. Every tier is reported, drained ones
    /// included.
    pub async fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        let escaped_schema = &self.escaped_schema;
        let sql = formatdoc!(
            r#"
                select queue, count(*) as pending
                    from {escaped_schema}.jobs
                    where status in ('queued', 'retrying')
                    group by queue;
            "#
        );

        let counted: Vec<QueueDepth> = query_as(&sql).fetch_all(&self.pool).await?;

        Ok(QueueTier::ALL
            .iter()
            .map(|tier| QueueDepth {
                queue: tier.as_str().to_string(),
                pending: counted
                    .iter()
                    .find(|depth| depth.queue == tier.as_str())
                    .map(|depth| depth.pending)
                    .unwrap_or(0),
            })
            .collect())
    }

    /// Runs one maintenance task, returning the number of rows affected.
    pub async fn cleanup(&self, task: CleanupTask) -> Result<u64> {
        let affected = task.execute(&self.pool, &self.escaped_schema).await?;
        if affected > 0 {
            info!(?task, affected, "Cleanup task removed rows");
        }
        Ok(affected)
    }
}
