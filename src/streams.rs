use std::time::Duration;

use futures::{stream, Stream};
use sqlx::postgres::PgListener;

use crate::broker::Broker;
use crate::errors::Result;
use crate::shutdown::ShutdownSignal;

/// Channel notified by the router whenever a job is enqueued.
pub const JOBS_CHANNEL: &str = "llm_relay_jobs_insert";

/// Why the worker woke up to look for a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamSource {
    Polling,
    Notify,
    RunOnce,
}

struct JobSignalStreamData {
    interval: tokio::time::Interval,
    listener: PgListener,
    shutdown_signal: ShutdownSignal,
}

/// Returns a stream that yields whenever a job may be available: on every
/// enqueue notification and on the poll interval as a fallback. The stream
/// ends when the shutdown signal resolves.
pub async fn job_signal_stream(
    broker: &Broker,
    poll_interval: Duration,
    shutdown_signal: ShutdownSignal,
) -> Result<impl Stream<Item = StreamSource>> {
    let interval = tokio::time::interval(poll_interval);
    let listener = broker.acquire_listener(JOBS_CHANNEL).await?;

    let stream_data = JobSignalStreamData {
        interval,
        listener,
        shutdown_signal,
    };
    let stream = stream::unfold(stream_data, |mut f| async {
        tokio::select! {
            _ = f.interval.tick() => Some((StreamSource::Polling, f)),
            _ = f.listener.recv() => Some((StreamSource::Notify, f)),
            _ = &mut f.shutdown_signal => None,
        }
    });

    Ok(stream)
}
