use std::sync::Arc;
use std::time::Duration;

use indoc::formatdoc;
use sqlx::query_as;
use tracing::{debug, trace};

use crate::broker::Broker;
use crate::errors::Result;

/// How long a failed attempt sleeps before polling the bucket again.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Token bucket shared by every worker process, state resident in the
/// `rate_buckets` table.
///
/// The refill-then-withdraw step runs inside one transaction holding the
/// bucket's row lock, so concurrent callers never collectively withdraw more
/// tokens than the bucket holds. Elapsed time is measured with the database
/// clock; worker clocks never enter the math.
///
/// `acquire` is a polling design, not a fair queue: callers retry on a fixed
/// short interval until their timeout elapses, and starvation under heavy
/// contention is an accepted tradeoff.
pub struct RateLimiter {
    broker: Arc<Broker>,
    escaped_schema: String,
    key: String,
    capacity: f64,
    period: Duration,
    poll_interval: Duration,
}

impl RateLimiter {
    /// `capacity` tokens are replenished per `period`, continuously.
    pub fn new(
        broker: Arc<Broker>,
        escaped_schema: impl Into<String>,
        key: impl Into<String>,
        capacity: f64,
        period: Duration,
    ) -> Self {
        RateLimiter {
            broker,
            escaped_schema: escaped_schema.into(),
            key: key.into(),
            capacity,
            period,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// One atomic attempt: refill from elapsed time, then withdraw if the
    /// balance covers the request. Returns whether tokens were granted.
    ///
    /// The bucket is created lazily, full, on first contact. On a denied
    /// attempt the accrued refill is still committed; the accounting is
    /// identical either way and the row lock is held for one statement less.
    pub async fn try_acquire(&self, tokens: f64) -> Result<bool> {
        let escaped_schema = &self.escaped_schema;

        let mut tx = self.broker.pool().begin().await?;

        // Locks the bucket row until commit.
        let refill_sql = formatdoc!(
            r#"
                insert into {escaped_schema}.rate_buckets as buckets (key, tokens, updated_at)
                values ($1, $2::double precision, now())
                on conflict (key) do update set
                    tokens = least(
                        $2::double precision,
                        buckets.tokens
                            + extract(epoch from (now() - buckets.updated_at))
                                * $2::double precision / $3::double precision
                    ),
                    updated_at = now()
                returning tokens
            "#
        );

        let (available,): (f64,) = query_as(&refill_sql)
            .bind(&self.key)
            .bind(self.capacity)
            .bind(self.period.as_secs_f64())
            .fetch_one(&mut *tx)
            .await?;

        let granted = available >= tokens;
        if granted {
            let withdraw_sql = formatdoc!(
                r#"
                    update {escaped_schema}.rate_buckets
                        set tokens = tokens - $2::double precision
                        where key = $1
                "#
            );

            sqlx::query(&withdraw_sql)
                .bind(&self.key)
                .bind(tokens)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        trace!(key = %self.key, available, granted, "Rate bucket attempt");
        Ok(granted)
    }

    /// Polls [`Self::try_acquire`] until granted or `timeout` elapses.
    /// Returns `false` on timeout; the caller decides what that means.
    pub async fn acquire(&self, tokens: f64, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.try_acquire(tokens).await? {
                return Ok(true);
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                debug!(key = %self.key, ?timeout, "Rate limit acquire timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
