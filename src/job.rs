use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

/// Priority above this value routes to the high queue.
pub const HIGH_PRIORITY_THRESHOLD: i16 = 5;
/// Priority below this value routes to the low queue.
pub const LOW_PRIORITY_THRESHOLD: i16 = -5;
/// Priorities are clamped to this symmetric range at submission.
pub const PRIORITY_BOUND: i16 = 10;

/// The durable queue a job is routed to, derived from its priority.
///
/// The mapping is a fixed partition: each priority maps to exactly one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTier {
    High,
    Default,
    Low,
}

impl QueueTier {
    pub fn from_priority(priority: i16) -> Self {
        if priority > HIGH_PRIORITY_THRESHOLD {
            QueueTier::High
        } else if priority < LOW_PRIORITY_THRESHOLD {
            QueueTier::Low
        } else {
            QueueTier::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueTier::High => "high",
            QueueTier::Default => "default",
            QueueTier::Low => "low",
        }
    }

    pub const ALL: [QueueTier; 3] = [QueueTier::High, QueueTier::Default, QueueTier::Low];
}

impl Display for QueueTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of work a job carries; decides how its payload is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ChatCompletion,
    BatchEmbeddings,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ChatCompletion => "chat_completion",
            JobKind::BatchEmbeddings => "batch_embeddings",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_completion" => Ok(JobKind::ChatCompletion),
            "batch_embeddings" => Ok(JobKind::BatchEmbeddings),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// Job lifecycle status as stored in the result store.
///
/// Transitions are monotonic forward, except that a retried job moves
/// `started -> retrying -> started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Started,
    Succeeded,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// One message of a chat conversation, forwarded to the provider verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".into(),
            content: content.into(),
        }
    }
}

fn default_stream() -> bool {
    true
}

/// Typed core of a chat completion job payload.
///
/// Only these fields are validated; everything else in the submission's
/// parameter bag lands in `extra` and is forwarded to the provider untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Single-message shorthand; ignored when `messages` is present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Full conversation; takes precedence over `message`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,

    /// Prepended as a system message when `messages` is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default = "default_stream")]
    pub stream: bool,

    /// Provider-specific fields passed through verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionParams {
    /// Builds the conversation forwarded to the provider, validating the
    /// typed core: either `messages` or `message` must be present.
    pub fn conversation(&self) -> Result<Vec<ChatMessage>, String> {
        if let Some(messages) = &self.messages {
            if messages.is_empty() {
                return Err("'messages' must not be empty".into());
            }
            return Ok(messages.clone());
        }

        let Some(message) = &self.message else {
            return Err("either 'message' or 'messages' is required".into());
        };

        let mut conversation = Vec::with_capacity(2);
        if let Some(system_prompt) = &self.system_prompt {
            conversation.push(ChatMessage::system(system_prompt.clone()));
        }
        conversation.push(ChatMessage::user(message.clone()));
        Ok(conversation)
    }
}

/// Typed core of a batch embeddings job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub texts: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A job row as stored in the durable queue.
///
/// `kind`, `queue` and `status` are kept as their wire strings; use
/// [`JobKind`]/[`QueueTier`]/[`JobStatus`] `FromStr` impls to interpret them.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct Job {
    id: Uuid,
    /// Scope of the session channel this job publishes to
    session_id: String,
    kind: String,
    queue: String,
    /// Higher runs first within a tier
    priority: i16,
    payload: Value,
    status: String,
    /// How many times it has been delivered
    attempts: i16,
    max_attempts: i16,
    /// If attempts > 0, why did it fail last ?
    last_error: Option<String>,
    result: Option<Value>,
    run_at: DateTime<Utc>,
    /// Undelivered jobs past this point are expired, never delivered
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
}

impl Job {
    /// Whether the retry budget allows another delivery after a failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
