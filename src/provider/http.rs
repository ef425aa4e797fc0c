use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::job::ChatMessage;

use super::{
    Completion, CompletionOutcome, CompletionProvider, CompletionRequest, Embeddings, Fragment,
    FragmentStream, ProviderError, Usage,
};

/// OpenAI-compatible HTTP provider.
///
/// Speaks `/chat/completions` and `/embeddings`, with incremental results
/// arriving as `data:` lines terminated by a `[DONE]` sentinel.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpProvider {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionOutcome, ProviderError> {
        // The typed core wins over any colliding extension field.
        let mut body = request.extra.clone();
        body.insert("model".into(), json!(request.model));
        body.insert(
            "messages".into(),
            messages_to_value(&request.messages)?,
        );
        body.insert("stream".into(), json!(request.stream));

        let response = self.post("/chat/completions", &Value::Object(body)).await?;

        if request.stream {
            debug!(model = %request.model, "Streaming completion opened");
            return Ok(CompletionOutcome::Stream(sse_fragments(
                response.bytes_stream(),
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Decode("response carried no content".into()))?;

        Ok(CompletionOutcome::Single(Completion {
            content,
            usage: parsed.usage,
        }))
    }

    async fn embed(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Embeddings, ProviderError> {
        let body = json!({ "model": model, "input": texts });
        let response = self.post("/embeddings", &body).await?;

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(Embeddings {
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            vectors: parsed.data.into_iter().map(|item| item.embedding).collect(),
        })
    }
}

fn messages_to_value(messages: &[ChatMessage]) -> Result<Value, ProviderError> {
    serde_json::to_value(messages).map_err(|e| ProviderError::Decode(e.to_string()))
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    model: Option<String>,
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

struct SseState<S> {
    inner: std::pin::Pin<Box<S>>,
    buffer: Vec<u8>,
    eof: bool,
    done: bool,
}

/// Turns a raw byte stream of `data:` lines into fragments, preserving
/// emission order. Lines that are not valid fragment chunks are skipped;
/// transport errors end the stream after being surfaced once.
fn sse_fragments<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = SseState {
        inner: Box::pin(bytes),
        buffer: Vec::new(),
        eof: false,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut s| async move {
        loop {
            if s.done {
                return None;
            }

            if let Some(pos) = s.buffer.iter().position(|&b| b == b'\n') {
                let mut line_end = pos;
                if line_end > 0 && s.buffer[line_end - 1] == b'\r' {
                    line_end -= 1;
                }
                let line = s.buffer[..line_end].to_vec();
                s.buffer.drain(..=pos);

                let Ok(line) = std::str::from_utf8(&line) else {
                    continue;
                };
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    s.done = true;
                    return None;
                }

                let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                return Some((Ok(Fragment { content }), s));
            }

            if s.eof {
                return None;
            }

            match s.inner.next().await {
                Some(Ok(chunk)) => s.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    s.done = true;
                    return Some((Err(ProviderError::Transport(e.to_string())), s));
                }
                None => {
                    s.eof = true;
                    // A final line without a trailing newline is still a line.
                    if !s.buffer.is_empty() {
                        s.buffer.push(b'\n');
                    }
                }
            }
        }
    }))
}
