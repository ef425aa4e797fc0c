use std::str::FromStr;

use getset::Getters;
use indoc::formatdoc;
use sqlx::{query_as, FromRow, PgExecutor};
use uuid::Uuid;

use crate::errors::Result;
use crate::job::JobStatus;

/// Status-polling view of a job, read by the façade's task status endpoint.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct TaskStatus {
    id: Uuid,
    status: String,
    attempts: i16,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
}

impl TaskStatus {
    /// The stored status as its typed form.
    pub fn parsed(&self) -> Option<JobStatus> {
        JobStatus::from_str(&self.status).ok()
    }

    /// Whether the job reached a terminal state and carries its result or
    /// error string.
    pub fn is_ready(&self) -> bool {
        self.parsed().map(|status| status.is_terminal()).unwrap_or(false)
    }
}

/// Looks up a job by identifier. Returns `None` for unknown ids and for
/// terminal rows already removed by result retention.
pub async fn task_status(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<Option<TaskStatus>> {
    let sql = formatdoc!(
        r#"
            select id, status, attempts, result, last_error
                from {escaped_schema}.jobs
                where id = $1::uuid;
        "#
    );

    let status = query_as(&sql).bind(job_id).fetch_optional(executor).await?;

    Ok(status)
}
