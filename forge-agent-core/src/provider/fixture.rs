//! Scripted model provider that replays recorded turns.
//!
//! A script is a JSON document `{"turns": [...]}`. Each turn belongs to an
//! agent (`main` when omitted) and every agent consumes its own turns in
//! order. Sub-agents without a script of their own share the turns keyed
//! `delegate`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use forge_protocol::ContentBlock;
use forge_protocol::StopReason;
use forge_protocol::Usage;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::ModelProvider;
use super::ModelRequest;
use super::ModelResponse;
use super::ProviderError;
use super::ResponseEvent;
use super::ResponseStream;

const MAIN_AGENT: &str = "main";
const SHARED_DELEGATE: &str = "delegate";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FixtureScript {
    #[serde(default)]
    pub turns: Vec<FixtureTurn>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FixtureToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFault {
    Network,
    RateLimit,
    Fatal,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FixtureTurn {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<FixtureToolCall>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub usage: Usage,
    /// Break the stream after its first delta. The turn stays current so
    /// the batch fallback replays it.
    #[serde(default)]
    pub stream_error: bool,
    /// Fail the request outright; the turn is consumed.
    #[serde(default)]
    pub provider_error: Option<FixtureFault>,
    /// Latency before the response starts.
    #[serde(default)]
    pub delay_ms: u64,
}

impl FixtureTurn {
    fn stop_reason(&self) -> StopReason {
        self.stop_reason.unwrap_or(if self.tool_calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        })
    }

    fn content(&self, agent: &str, position: usize) -> Vec<ContentBlock> {
        let mut content = Vec::new();
        if let Some(text) = self.text.as_ref().filter(|text| !text.is_empty()) {
            content.push(ContentBlock::text(text.clone()));
        }
        for (index, call) in self.tool_calls.iter().enumerate() {
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("{agent}-{position}-{index}"));
            let input = if call.input.is_null() {
                serde_json::json!({})
            } else {
                call.input.clone()
            };
            content.push(ContentBlock::ToolUse {
                id,
                name: call.name.clone(),
                input,
            });
        }
        content
    }

    fn fault(&self) -> Option<ProviderError> {
        self.provider_error.map(|fault| match fault {
            FixtureFault::Network => {
                ProviderError::Network("connection reset by fixture".to_string())
            }
            FixtureFault::RateLimit => ProviderError::RateLimit {
                retry_after: Some(Duration::from_secs(1)),
            },
            FixtureFault::Fatal => ProviderError::Fatal("fixture rejected the request".to_string()),
        })
    }
}

pub struct FixtureProvider {
    turns: HashMap<String, Vec<FixtureTurn>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl FixtureProvider {
    pub fn new(script: FixtureScript) -> Self {
        let mut turns: HashMap<String, Vec<FixtureTurn>> = HashMap::new();
        for turn in script.turns {
            let agent = turn.agent.clone().unwrap_or_else(|| MAIN_AGENT.to_string());
            turns.entry(agent).or_default().push(turn);
        }
        Self {
            turns,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let script: FixtureScript = serde_json::from_str(raw).context("invalid fixture script")?;
        Ok(Self::new(script))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Turns not yet consumed by `agent`.
    pub fn remaining(&self, agent: &str) -> usize {
        let key = self.script_key(agent);
        let cursor = self.cursor(&key);
        self.turns.get(&key).map_or(0, |turns| turns.len().saturating_sub(cursor))
    }

    fn script_key(&self, agent: &str) -> String {
        if self.turns.contains_key(agent) || agent == MAIN_AGENT {
            agent.to_string()
        } else {
            SHARED_DELEGATE.to_string()
        }
    }

    fn cursor(&self, key: &str) -> usize {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn current(&self, agent: &str) -> Result<(String, usize, FixtureTurn), ProviderError> {
        let key = self.script_key(agent);
        let position = self.cursor(&key);
        self.turns
            .get(&key)
            .and_then(|turns| turns.get(position))
            .cloned()
            .map(|turn| (key, position, turn))
            .ok_or_else(|| ProviderError::ScriptExhausted(agent.to_string()))
    }

    fn advance(&self, key: &str) {
        *self
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl ModelProvider for FixtureProvider {
    async fn stream_with_tools(
        &self,
        request: &ModelRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let (key, position, turn) = self.current(&request.agent)?;
        if turn.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(turn.delay_ms)).await;
        }
        if let Some(err) = turn.fault() {
            self.advance(&key);
            return Err(err);
        }
        if !turn.stream_error {
            self.advance(&key);
        }
        debug!(
            agent = %request.agent,
            position,
            stream_error = turn.stream_error,
            "replaying fixture turn"
        );

        let content = turn.content(&request.agent, position);
        let stop_reason = turn.stop_reason();
        let usage = turn.usage;
        let stream_error = turn.stream_error;
        let (tx_event, rx_event) = mpsc::channel::<Result<ResponseEvent, ProviderError>>(64);
        tokio::spawn(async move {
            if tx_event.send(Ok(ResponseEvent::StreamStart)).await.is_err() {
                return;
            }
            for block in content {
                let event = match block {
                    ContentBlock::Text { text } => ResponseEvent::TextDelta(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        let start = ResponseEvent::ToolStart {
                            id: id.clone(),
                            name: name.clone(),
                        };
                        if tx_event.send(Ok(start)).await.is_err() {
                            return;
                        }
                        ResponseEvent::ToolEnd { id, name, input }
                    }
                    ContentBlock::ToolResult { .. } => continue,
                };
                if tx_event.send(Ok(event)).await.is_err() {
                    return;
                }
                if stream_error {
                    let closed = ProviderError::Stream("connection closed mid-stream".to_string());
                    let _ = tx_event.send(Err(closed)).await;
                    return;
                }
            }
            if stream_error {
                let _ = tx_event
                    .send(Err(ProviderError::Stream("connection closed mid-stream".to_string())))
                    .await;
                return;
            }
            let _ = tx_event.send(Ok(ResponseEvent::Completed { stop_reason, usage })).await;
        });
        Ok(ResponseStream::new(rx_event))
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let (key, position, turn) = self.current(&request.agent)?;
        self.advance(&key);
        if let Some(err) = turn.fault() {
            return Err(err);
        }
        Ok(ModelResponse {
            content: turn.content(&request.agent, position),
            stop_reason: turn.stop_reason(),
            usage: turn.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::collect_response;
    use crate::provider::request_with_fallback;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(agent: &str) -> ModelRequest {
        ModelRequest {
            agent: agent.to_string(),
            system: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 1024,
        }
    }

    fn provider(script: Value) -> FixtureProvider {
        FixtureProvider::from_json_str(&script.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_replays_turns_in_order_per_agent() {
        let provider = provider(json!({
            "turns": [
                {"tool_calls": [{"id": "t1", "name": "read_file", "input": {"path": "a.liquid"}}]},
                {"agent": "delegate", "text": "sub done"},
                {"text": "all done"}
            ]
        }));

        let mut stream = provider.stream_with_tools(&request("main")).await.unwrap();
        let first = collect_response(&mut stream, Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.stop_reason, StopReason::ToolUse);
        assert_eq!(first.tool_calls()[0].id, "t1");

        let sub = provider.complete(&request("delegate-d1")).await.unwrap();
        assert_eq!(sub.text(), "sub done");

        let mut stream = provider.stream_with_tools(&request("main")).await.unwrap();
        let last = collect_response(&mut stream, Duration::from_secs(5)).await.unwrap();
        assert_eq!(last.text(), "all done");
        assert_eq!(last.stop_reason, StopReason::EndTurn);

        assert_eq!(
            provider.complete(&request("main")).await.unwrap_err(),
            ProviderError::ScriptExhausted("main".to_string())
        );
    }

    #[tokio::test]
    async fn test_stream_error_turn_is_replayed_by_complete() {
        let provider = provider(json!({
            "turns": [{"text": "partial", "tool_calls": [{"name": "list_files"}], "stream_error": true}]
        }));
        let mut stream = provider.stream_with_tools(&request("main")).await.unwrap();
        let err = collect_response(&mut stream, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_stream_fault());
        assert_eq!(provider.remaining("main"), 1);

        let response = provider.complete(&request("main")).await.unwrap();
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.tool_calls()[0].id, "main-0-0");
        assert_eq!(provider.remaining("main"), 0);
    }

    #[tokio::test]
    async fn test_broken_stream_falls_back_to_batch_call() {
        let provider = provider(json!({
            "turns": [
                {"tool_calls": [{"id": "t1", "name": "list_files"}], "stream_error": true},
                {"text": "done"}
            ]
        }));
        let response = request_with_fallback(&provider, &request("main"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.tool_calls()[0].id, "t1");
        assert_eq!(provider.remaining("main"), 1);
    }

    #[tokio::test]
    async fn test_provider_error_consumes_turn() {
        let provider = provider(json!({
            "turns": [{"provider_error": "network"}, {"text": "ok"}]
        }));
        let err = provider.stream_with_tools(&request("main")).await.err().unwrap();
        assert!(err.is_retryable());
        assert_eq!(provider.remaining("main"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_elapses_before_stream() {
        let provider = provider(json!({"turns": [{"text": "slow", "delay_ms": 5000}]}));
        let started = tokio::time::Instant::now();
        let mut stream = provider.stream_with_tools(&request("main")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        let response = collect_response(&mut stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.text(), "slow");
    }
}
