//! Delegation to sub-agents.
//!
//! A `delegate` call runs a nested, bounded model loop with the built-in
//! file tools only. It works on whatever [`forge_core::FileAccess`] its
//! context carries: the shared store for a lone delegate, its own worktree
//! when several delegates run in parallel.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use forge_core::config::Config;
use forge_core::scheduler::execute_plan;
use forge_core::scheduler::plan_batch;
use forge_core::tools::ToolExecutor;
use forge_core::tools::ToolOutput;
use forge_core::tools::builtin_dispatcher;
use forge_core::ToolContext;
use forge_core::ToolDispatcher;
use forge_protocol::Message;
use forge_protocol::StopReason;
use forge_protocol::ToolInput;
use forge_protocol::tools;
use forge_protocol::tools::builtin_tool_definitions;
use tracing::debug;
use tracing::info;

use crate::provider::ModelProvider;
use crate::provider::ModelRequest;
use crate::provider::request_with_fallback;

const SUB_AGENT_SYSTEM: &str = "You are a specialist sub-agent working on one narrow task inside a larger change. \
Use the file tools to complete the task on the listed files only, then reply with a one-paragraph summary of what you changed.";

const MAX_TOKENS: u32 = 8_192;

pub struct DelegateTool {
    provider: Arc<dyn ModelProvider>,
    config: Config,
    dispatcher: ToolDispatcher,
}

impl DelegateTool {
    pub fn new(provider: Arc<dyn ModelProvider>, config: Config) -> Self {
        let dispatcher = builtin_dispatcher(config.dispatcher.clone());
        Self {
            provider,
            config,
            dispatcher,
        }
    }

    fn task_prompt(task: &str, files: &[String]) -> String {
        if files.is_empty() {
            task.to_string()
        } else {
            format!("{task}\n\nFiles: {}", files.join(", "))
        }
    }
}

#[async_trait]
impl ToolExecutor for DelegateTool {
    fn name(&self) -> &'static str {
        tools::DELEGATE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::Delegate { task, files } = input else {
            return ToolOutput::error(format!("delegate cannot handle `{}` input", input.name()));
        };
        let agent = ctx.agent.clone();
        info!(%agent, files = files.len(), "sub-agent started");

        let mut messages = vec![Message::user_text(Self::task_prompt(task, files))];
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut summary = String::new();
        let definitions = builtin_tool_definitions(false);

        for turn in 0..self.config.execution.max_sub_agent_iterations.max(1) {
            if ctx.cancel.is_cancelled() {
                return ToolOutput::error(format!("aborted: sub-agent {agent} was cancelled"));
            }
            let request = ModelRequest {
                agent: agent.clone(),
                system: SUB_AGENT_SYSTEM.to_string(),
                messages: messages.clone(),
                tools: definitions.clone(),
                max_tokens: MAX_TOKENS,
            };
            let idle_timeout = self.config.execution.stream_idle_timeout;
            let response =
                match request_with_fallback(self.provider.as_ref(), &request, idle_timeout).await {
                    Ok(response) => response,
                    Err(err) => {
                        return ToolOutput::error(format!("sub-agent {agent} failed: {err}"));
                    }
                };
            let calls = response.tool_calls();
            let stop_reason = response.stop_reason;
            summary = response.text();
            messages.push(response.into_message());
            if calls.is_empty() {
                break;
            }

            let plan = plan_batch(&calls);
            let results = execute_plan(&plan, self.config.scheduler.fan_out, |planned| {
                self.dispatcher.dispatch(&planned.call, ctx)
            })
            .await;
            for result in &results {
                if !result.is_error() {
                    touched.extend(result.output.touched.iter().cloned());
                }
            }
            debug!(%agent, turn, calls = results.len(), "sub-agent turn finished");
            let blocks = results.iter().map(|result| result.to_block()).collect();
            messages.push(Message::tool_results(blocks));
            if stop_reason != StopReason::ToolUse {
                break;
            }
        }

        let summary = if summary.trim().is_empty() {
            "no summary".to_string()
        } else {
            summary.trim().to_string()
        };
        let mut output = ToolOutput::success(if touched.is_empty() {
            format!("Sub-agent {agent} finished without changes: {summary}")
        } else {
            format!(
                "Sub-agent {agent} finished: {summary}\nFiles changed: {}",
                touched.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        });
        output.touched = touched.into_iter().collect();
        info!(%agent, touched = output.touched.len(), "sub-agent finished");
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixtureProvider;
    use forge_core::FileStore;
    use forge_core::compaction::Lookaside;
    use forge_core::file_store::InMemoryFileBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> Arc<FileStore> {
        let backend = Arc::new(InMemoryFileBackend::with_files([(
            "snippets/badge.liquid",
            "<span>old</span>",
        )]));
        Arc::new(FileStore::new("p1", backend, Config::default().file_store))
    }

    #[tokio::test]
    async fn test_delegate_runs_nested_loop_on_context_files() {
        let provider = FixtureProvider::from_json_str(
            &json!({
                "turns": [
                    {"agent": "delegate", "tool_calls": [
                        {"id": "s1", "name": "read_file", "input": {"path": "snippets/badge.liquid"}},
                    ]},
                    {"agent": "delegate", "tool_calls": [
                        {"id": "s2", "name": "edit_file", "input": {"path": "snippets/badge.liquid", "old_text": "old", "new_text": "new"}},
                    ]},
                    {"agent": "delegate", "text": "Updated the badge label."}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let tool = DelegateTool::new(Arc::new(provider), Config::default());
        let files = store();
        let ctx = ToolContext::new("delegate-d1", files.clone(), Arc::new(Lookaside::new()));
        let input = ToolInput::Delegate {
            task: "rename the badge".to_string(),
            files: vec!["snippets/badge.liquid".to_string()],
        };

        let output = tool.execute(&input, &ctx).await;
        assert!(!output.is_error, "{}", output.content);
        assert_eq!(output.touched, vec!["snippets/badge.liquid".to_string()]);
        assert!(output.content.contains("Updated the badge label."));
        assert_eq!(
            files.peek("snippets/badge.liquid").await.unwrap().as_deref(),
            Some("<span>new</span>")
        );
    }

    #[tokio::test]
    async fn test_provider_failure_is_an_error_result() {
        let provider = FixtureProvider::from_json_str(r#"{"turns": []}"#).unwrap();
        let tool = DelegateTool::new(Arc::new(provider), Config::default());
        let ctx = ToolContext::new("delegate-d1", store(), Arc::new(Lookaside::new()));
        let input = ToolInput::Delegate {
            task: "anything".to_string(),
            files: Vec::new(),
        };
        let output = tool.execute(&input, &ctx).await;
        assert!(output.is_error);
        assert!(output.content.contains("exhausted"));
    }
}
