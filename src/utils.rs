use sqlx::{query, Executor, Postgres, Row};

use crate::errors::Result;

/// Escapes an identifier server-side so it can be interpolated into SQL.
pub async fn escape_identifier<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    identifier: &str,
) -> Result<String> {
    let row = query("select format('%I', $1::text) as escaped_identifier")
        .bind(identifier)
        .fetch_one(executor)
        .await?;

    Ok(row.get("escaped_identifier"))
}
