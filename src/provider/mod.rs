//! Boundary to the external completion/embeddings provider.
//!
//! The provider is an opaque remote call: it accepts a parameter bag and
//! returns either a single response or a sequence of incremental text
//! fragments. Everything behind this trait is out of the relay's scope.

mod http;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::job::ChatMessage;

pub use http::HttpProvider;

/// Errors raised by the external completion call.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider could not be reached or the connection broke mid-call
    #[error("Provider transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-success status
    #[error("Provider returned status {status}: {body}")]
    Api { status: u16, body: String },

    /// The provider's response could not be decoded
    #[error("Provider response could not be decoded: {0}")]
    Decode(String),
}

/// Token accounting reported by the provider on a single response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One incremental text fragment of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub content: String,
}

/// A full, non-streamed completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
}

pub type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<Fragment, ProviderError>> + Send>>;

/// What a completion call produced: one response, or fragments as they come.
pub enum CompletionOutcome {
    Single(Completion),
    Stream(FragmentStream),
}

/// The request forwarded to the provider. `extra` carries provider-specific
/// fields verbatim; the executor never interprets them.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub extra: Map<String, Value>,
}

/// Embedding vectors for a batch of input texts, in input order.
#[derive(Debug, Clone)]
pub struct Embeddings {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
}

/// The opaque remote completion/embeddings call.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionOutcome, ProviderError>;

    async fn embed(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Embeddings, ProviderError>;
}
