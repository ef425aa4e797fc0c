use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{RelayError, Result};

/// Owns the process's single shared broker connection pool.
///
/// All LISTEN channel creation goes through [`Broker::acquire_listener`] and
/// is serialized by an internal lock, so only one channel is being opened at
/// a time even under concurrent relays and workers. The pool itself is shared
/// freely; sqlx re-establishes broken connections on the next checkout, so a
/// forcibly closed connection does not surface to callers of later acquires.
///
/// Constructed explicitly at startup and passed by reference to the router,
/// executor and relay; closed by the process's shutdown sequence.
pub struct Broker {
    pool: PgPool,
    channel_lock: Mutex<()>,
    connected: AtomicBool,
}

impl Broker {
    /// Establishes the pool, verifying connectivity with an initial ping.
    ///
    /// An unreachable broker surfaces as [`RelayError::BrokerUnavailable`];
    /// the pool does not retry on the caller's behalf.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(RelayError::BrokerUnavailable)?;

        info!(max_connections, "Broker connection established");

        Ok(Self::from_pool(pool))
    }

    /// Wraps an existing pool (used by tests and embedding applications).
    pub fn from_pool(pool: PgPool) -> Self {
        Broker {
            pool,
            channel_lock: Mutex::new(()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a dedicated LISTEN connection subscribed to `channel`.
    ///
    /// Channel creation is mutually exclusive across tasks. The returned
    /// listener owns its connection; dropping it releases the subscription.
    pub async fn acquire_listener(&self, channel: &str) -> Result<PgListener> {
        let _guard = self.channel_lock.lock().await;

        let mut listener = match PgListener::connect_with(&self.pool).await {
            Ok(listener) => listener,
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                warn!(error = %e, "Failed to open listener connection");
                return Err(RelayError::BrokerUnavailable(e));
            }
        };
        listener.listen(channel).await?;
        self.connected.store(true, Ordering::Relaxed);
        debug!(channel, "Listener subscribed");

        Ok(listener)
    }

    /// Publishes a transient notification on `channel`.
    ///
    /// Payloads are delivered in publish order to each subscriber; a channel
    /// with no subscriber drops the payload (pub/sub semantics).
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let result = sqlx::query("select pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Last observed connectivity state, for health reporting.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Actively verifies connectivity and updates the health flag.
    pub async fn ping(&self) -> bool {
        let ok = sqlx::query("select 1").execute(&self.pool).await.is_ok();
        self.connected.store(ok, Ordering::Relaxed);
        ok
    }

    /// Drains the pool. Called by the process shutdown sequence.
    pub async fn close(&self) {
        self.pool.close().await;
        self.connected.store(false, Ordering::Relaxed);
        info!("Broker connection closed");
    }
}
