use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::broker::Broker;
use crate::errors::Result;
use crate::provider::Usage;

/// Prefix of every session channel name.
const CHANNEL_PREFIX: &str = "llm_stream_";

/// Longest accepted session identifier. Channel names must stay inside the
/// broker's 63-byte identifier limit, prefix included.
pub const MAX_SESSION_ID_LEN: usize = 48;

/// NOTIFY payloads are capped by the broker (8000 bytes); events above this
/// budget have their optional content stripped before publishing.
const NOTIFY_PAYLOAD_MAX: usize = 7800;

/// Channel name for a session. Pure function of the session identifier.
pub fn session_channel(session_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{session_id}")
}

/// Core validation applied at submission: the identifier must fit in a
/// channel name and stay within the identifier character set.
pub fn validate_session_id(session_id: &str) -> std::result::Result<(), String> {
    if session_id.is_empty() {
        return Err("session_id must not be empty".into());
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(format!(
            "session_id must be at most {MAX_SESSION_ID_LEN} bytes"
        ));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err("session_id may only contain [A-Za-z0-9-_.:]".into());
    }
    Ok(())
}

/// An event published on a session channel by the worker and forwarded to
/// the caller by the streaming relay.
///
/// `Complete` and `Error` are terminal; `Timeout` is synthesized by the relay
/// itself and never crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        status: String,
        task_id: Uuid,
    },
    Chunk {
        content: String,
        index: u32,
    },
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u32>,
    },
    Error {
        error: String,
    },
    Timeout,
}

impl SessionEvent {
    pub fn started(task_id: Uuid) -> Self {
        SessionEvent::Status {
            status: "started".into(),
            task_id,
        }
    }

    /// Terminal events end the relay after being forwarded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Complete { .. } | SessionEvent::Error { .. })
    }
}

/// Publishes one event on the session's channel, in call order.
///
/// A `Complete` whose serialized form exceeds the payload budget is published
/// without its content; the full text stays available through the task status
/// lookup.
pub async fn publish_event(
    broker: &Broker,
    session_id: &str,
    event: &SessionEvent,
) -> Result<()> {
    let mut payload = serde_json::to_string(event)?;

    if payload.len() > NOTIFY_PAYLOAD_MAX {
        if let SessionEvent::Complete {
            usage,
            total_chunks,
            ..
        } = event
        {
            debug!(
                session_id,
                size = payload.len(),
                "Complete event exceeds payload budget, content omitted"
            );
            payload = serde_json::to_string(&SessionEvent::Complete {
                content: None,
                usage: usage.clone(),
                total_chunks: *total_chunks,
            })?;
        }
    }

    broker.notify(&session_channel(session_id), &payload).await
}
