//! Model provider abstraction.
//!
//! The loop treats the model as a streaming tool-calling service. A stream
//! that breaks mid-response surfaces a terminal `Err` event, distinct from
//! normal completion, and the loop then falls back to [`ModelProvider::complete`].

mod fixture;

use std::time::Duration;

use async_trait::async_trait;
use forge_protocol::ContentBlock;
use forge_protocol::Message;
use forge_protocol::StopReason;
use forge_protocol::ToolCall;
use forge_protocol::ToolDefinition;
use forge_protocol::Usage;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

pub use fixture::FixtureFault;
pub use fixture::FixtureProvider;
pub use fixture::FixtureScript;
pub use fixture::FixtureToolCall;
pub use fixture::FixtureTurn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The stream broke before completion.
    #[error("stream error: {0}")]
    Stream(String),

    #[error("no stream event within {0:?}")]
    IdleTimeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    #[error("malformed model response: {0}")]
    Malformed(String),

    /// A scripted provider ran out of turns.
    #[error("model script exhausted for agent `{0}`")]
    ScriptExhausted(String),

    #[error("model request rejected: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Retryable faults take the checkpoint-and-continue path instead of
    /// failing the execution.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stream(_)
                | Self::IdleTimeout(_)
                | Self::Network(_)
                | Self::RateLimit { .. }
                | Self::Malformed(_)
        )
    }

    /// Faults after which the same request can still succeed as a batch
    /// call.
    pub fn is_stream_fault(&self) -> bool {
        matches!(self, Self::Stream(_) | Self::IdleTimeout(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseEvent {
    StreamStart,
    TextDelta(String),
    ThinkingDelta(String),
    ToolStart { id: String, name: String },
    ToolEnd { id: String, name: String, input: Value },
    Completed { stop_reason: StopReason, usage: Usage },
}

pub struct ResponseStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ResponseEvent, ProviderError>>,
}

impl ResponseStream {
    pub fn new(rx_event: mpsc::Receiver<Result<ResponseEvent, ProviderError>>) -> Self {
        Self { rx_event }
    }

    pub async fn next(&mut self) -> Option<Result<ResponseEvent, ProviderError>> {
        self.rx_event.recv().await
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    /// `main` for the top-level loop, the sub-agent name otherwise.
    pub agent: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ModelResponse {
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some(ToolCall::new(id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn into_message(self) -> Message {
        Message::assistant(self.content)
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_with_tools(
        &self,
        request: &ModelRequest,
    ) -> Result<ResponseStream, ProviderError>;

    /// Non-streaming batch call.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError>;
}

/// Drains `stream` into a response. Silence longer than `idle_timeout` and a
/// stream that closes without `Completed` are both errors.
pub async fn collect_response(
    stream: &mut ResponseStream,
    idle_timeout: Duration,
) -> Result<ModelResponse, ProviderError> {
    let mut content = Vec::new();
    let mut text = String::new();
    loop {
        let event = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(event)) => event?,
            Ok(None) => {
                return Err(ProviderError::Stream("stream closed before completion".to_string()));
            }
            Err(_) => return Err(ProviderError::IdleTimeout(idle_timeout)),
        };
        match event {
            ResponseEvent::StreamStart
            | ResponseEvent::ThinkingDelta(_)
            | ResponseEvent::ToolStart { .. } => {}
            ResponseEvent::TextDelta(delta) => text.push_str(&delta),
            ResponseEvent::ToolEnd { id, name, input } => {
                if !text.is_empty() {
                    content.push(ContentBlock::text(std::mem::take(&mut text)));
                }
                content.push(ContentBlock::ToolUse { id, name, input });
            }
            ResponseEvent::Completed { stop_reason, usage } => {
                if !text.is_empty() {
                    content.push(ContentBlock::text(text));
                }
                return Ok(ModelResponse {
                    content,
                    stop_reason,
                    usage,
                });
            }
        }
    }
}

/// Streams one completion, falling back to a batch call when the stream
/// breaks so the loop never stalls on a dead connection.
pub async fn request_with_fallback(
    provider: &dyn ModelProvider,
    request: &ModelRequest,
    idle_timeout: Duration,
) -> Result<ModelResponse, ProviderError> {
    let streamed = match provider.stream_with_tools(request).await {
        Ok(mut stream) => collect_response(&mut stream, idle_timeout).await,
        Err(err) => Err(err),
    };
    match streamed {
        Err(err) if err.is_stream_fault() => {
            warn!(agent = %request.agent, "stream failed, retrying as batch call: {err}");
            provider.complete(request).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stream_of(events: Vec<Result<ResponseEvent, ProviderError>>, close: bool) -> ResponseStream {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in events {
                let _ = tx.send(event).await;
            }
            if !close {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
        ResponseStream::new(rx)
    }

    #[tokio::test]
    async fn test_collects_text_and_tool_calls() {
        let mut stream = stream_of(
            vec![
                Ok(ResponseEvent::StreamStart),
                Ok(ResponseEvent::TextDelta("Reading ".to_string())),
                Ok(ResponseEvent::TextDelta("header".to_string())),
                Ok(ResponseEvent::ToolStart {
                    id: "t1".to_string(),
                    name: "read_file".to_string(),
                }),
                Ok(ResponseEvent::ToolEnd {
                    id: "t1".to_string(),
                    name: "read_file".to_string(),
                    input: json!({"path": "a.liquid"}),
                }),
                Ok(ResponseEvent::Completed {
                    stop_reason: StopReason::ToolUse,
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                }),
            ],
            true,
        );
        let response = collect_response(&mut stream, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.text(), "Reading header");
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.tool_calls()[0].name, "read_file");
        assert_eq!(response.usage.total(), 15);
    }

    #[tokio::test]
    async fn test_closed_stream_is_an_error() {
        let mut stream = stream_of(vec![Ok(ResponseEvent::TextDelta("partial".to_string()))], true);
        let err = collect_response(&mut stream, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_stream_fault());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_times_out() {
        let mut stream = stream_of(vec![Ok(ResponseEvent::StreamStart)], false);
        let err = collect_response(&mut stream, Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err, ProviderError::IdleTimeout(Duration::from_secs(60)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Network("reset".to_string()).is_retryable());
        assert!(ProviderError::RateLimit { retry_after: None }.is_retryable());
        assert!(!ProviderError::Fatal("bad key".to_string()).is_retryable());
        assert!(!ProviderError::ScriptExhausted("main".to_string()).is_retryable());
    }
}
