use std::time::Duration;

use futures::{stream, Stream};
use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::errors::Result;
use crate::session::{session_channel, SessionEvent};

/// Idle window used when the caller does not override it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard ceiling for caller-supplied idle timeouts.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

struct RelayStreamData {
    listener: PgListener,
    idle_timeout: Duration,
    session_id: String,
    done: bool,
}

/// Subscribes to a session's channel and returns its events as a lazy
/// stream, in publish order.
///
/// The stream suspends only while waiting for the next message or for
/// `idle_timeout`, whichever comes first. It ends after forwarding a
/// terminal `complete`/`error` event, or after emitting one synthetic
/// `timeout` event when nothing arrived inside the idle window.
///
/// Dropping the stream — a caller disconnect — drops the LISTEN connection
/// with it, releasing the subscription in the same cleanup path rather than
/// on a timer.
pub async fn relay(
    broker: &Broker,
    session_id: &str,
    idle_timeout: Duration,
) -> Result<impl Stream<Item = SessionEvent>> {
    let idle_timeout = idle_timeout.min(MAX_IDLE_TIMEOUT);
    let listener = broker
        .acquire_listener(&session_channel(session_id))
        .await?;
    info!(session_id, "Relay subscribed");

    let stream_data = RelayStreamData {
        listener,
        idle_timeout,
        session_id: session_id.to_string(),
        done: false,
    };

    Ok(stream::unfold(stream_data, |mut s| async move {
        if s.done {
            return None;
        }

        loop {
            match tokio::time::timeout(s.idle_timeout, s.listener.recv()).await {
                Err(_) => {
                    debug!(session_id = %s.session_id, "Relay idle timeout");
                    s.done = true;
                    return Some((SessionEvent::Timeout, s));
                }
                Ok(Err(e)) => {
                    warn!(
                        session_id = %s.session_id,
                        error = %e,
                        "Relay lost its subscription"
                    );
                    s.done = true;
                    return Some((
                        SessionEvent::Error {
                            error: format!("subscription lost: {e}"),
                        },
                        s,
                    ));
                }
                Ok(Ok(notification)) => {
                    let event =
                        match serde_json::from_str::<SessionEvent>(notification.payload()) {
                            Ok(event) => event,
                            Err(e) => {
                                // Not one of ours; skip without breaking order.
                                warn!(
                                    session_id = %s.session_id,
                                    error = %e,
                                    "Skipping unparseable session event"
                                );
                                continue;
                            }
                        };

                    if event.is_terminal() {
                        s.done = true;
                    }
                    return Some((event, s));
                }
            }
        }
    }))
}
