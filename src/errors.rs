use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors that can occur while routing, executing or relaying jobs.
///
/// The broker variants distinguish "the broker could not be reached at all"
/// (a service-unavailable condition for the caller) from errors returned by a
/// reachable broker.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The broker connection could not be established or was lost
    #[error("Broker is unavailable: {0}")]
    BrokerUnavailable(#[source] sqlx::Error),

    /// An error occurred while executing a query against a reachable broker
    #[error("Error occured while query: {0}")]
    Sql(#[source] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing payload: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// The rate limiter did not grant tokens within the caller's window
    #[error("Rate limit on '{resource}' not acquired within {timeout:?}")]
    RateLimitTimeout { resource: String, timeout: Duration },

    /// The job's soft execution time budget elapsed mid-execution
    #[error("Execution time limit exceeded")]
    ExecutionTimeLimit,

    /// The external completion call failed
    #[error("Provider call failed: {0}")]
    Provider(#[from] ProviderError),

    /// The job payload failed core validation or could not be parsed
    #[error("Malformed job payload: {0}")]
    MalformedJob(String),
}

impl From<sqlx::Error> for RelayError {
    /// Connection-level failures become `BrokerUnavailable`; everything else
    /// is a plain query error.
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => RelayError::BrokerUnavailable(e),
            e => RelayError::Sql(e),
        }
    }
}

/// A Result type alias for RelayError.
pub type Result<T> = core::result::Result<T, RelayError>;
