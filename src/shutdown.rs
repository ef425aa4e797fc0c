use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{future::Shared, FutureExt};
use tokio::select;
use tokio::sync::Notify;
use tracing::info;

/// A cloneable future that resolves once shutdown is requested.
///
/// Workers hold a clone and check it between dequeue iterations, so a
/// shutdown stops new deliveries while the in-flight job finishes (or is
/// abandoned after the grace period, letting the broker redeliver it).
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

#[cfg(unix)]
async fn os_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("Failed to listen to unix shutdown signal");
    let mut terminate =
        signal(SignalKind::terminate()).expect("Failed to listen to unix shutdown signal");
    let mut hangup =
        signal(SignalKind::hangup()).expect("Failed to listen to unix shutdown signal");

    select! {
        _ = interrupt.recv() => (),
        _ = terminate.recv() => (),
        _ = hangup.recv() => (),
    }
}

#[cfg(not(unix))]
async fn os_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen to ctrl-c shutdown signal");
}

/// Builds the process shutdown signal: resolves on an OS termination signal
/// or when `trigger` is notified programmatically.
pub fn shutdown_signal(trigger: Arc<Notify>) -> ShutdownSignal {
    async move {
        select! {
            _ = os_shutdown_signal() => {
                info!("Shutdown signal detected. Attempting graceful shutdown...");
            }
            _ = trigger.notified() => {
                info!("Shutdown requested. Attempting graceful shutdown...");
            }
        }
    }
    .boxed()
    .shared()
}
