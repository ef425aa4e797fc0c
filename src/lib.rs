//! Priority job queue, distributed rate limiting and session streaming for
//! LLM completion workloads, backed by PostgreSQL.
//!
//! Completion requests are enqueued durably with a priority, executed by
//! horizontally scalable worker processes behind one shared token-bucket
//! rate limit, and their incremental output is relayed back to the caller
//! over a per-session broadcast channel, decoupled from the submitting
//! connection.
//!
//! The moving parts, producer to consumer:
//!
//! - [`JobRouter`] maps a submission to a priority tier and enqueues it,
//!   returning a task id immediately.
//! - [`Worker`] dequeues one job at a time (late acknowledgment, so crashed
//!   workers' jobs are redelivered), acquires a rate token, calls the
//!   provider, and publishes `chunk`/`complete`/`error` events on the
//!   session channel. Transient failures retry with exponential backoff and
//!   jitter.
//! - [`relay`] subscribes to a session channel and forwards events to the
//!   caller in publish order until a terminal event or idle timeout.
//! - [`RelayUtils`] answers task status lookups and keeps the tables
//!   bounded.

pub mod broker;
pub mod builder;
pub mod config;
pub mod errors;
pub mod executor;
pub mod job;
pub mod migrations;
pub mod provider;
pub mod rate_limiter;
pub mod relay;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod sql;
pub mod streams;
pub mod utils;
pub mod worker_utils;

pub use broker::Broker;
pub use builder::{WorkerBuildError, WorkerOptions};
pub use config::{ConfigError, RelayConfig};
pub use errors::{RelayError, Result};
pub use executor::{Worker, WorkerRuntimeError};
pub use job::{
    ChatMessage, CompletionParams, EmbeddingParams, Job, JobKind, JobStatus, QueueTier,
};
pub use migrations::migrate;
pub use provider::{
    Completion, CompletionOutcome, CompletionProvider, CompletionRequest, Embeddings, Fragment,
    FragmentStream, HttpProvider, ProviderError, Usage,
};
pub use rate_limiter::RateLimiter;
pub use relay::{relay, DEFAULT_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT};
pub use router::{EmbeddingsRequest, JobRouter, SubmitRequest, Submission};
pub use session::{publish_event, session_channel, SessionEvent};
pub use shutdown::{shutdown_signal, ShutdownSignal};
pub use sql::task_status::TaskStatus;
pub use utils::escape_identifier;
pub use worker_utils::{CleanupTask, QueueDepth, RelayUtils};
