//! Tool dispatch.
//!
//! The dispatcher parses a raw [`ToolCall`] into the tagged [`ToolInput`],
//! routes it to the registered executor and wraps execution in the
//! cancellation and timeout envelope. Every outcome, including unknown
//! tools, expiry and cancellation, comes back as a [`DispatchResult`]
//! carrying an error payload the model can read.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_protocol::ContentBlock;
use forge_protocol::ToolCall;
use forge_protocol::ToolInput;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

pub use builtin::AUTO_LINT_PREFIX;
pub use builtin::builtin_dispatcher;
pub use builtin::register_builtin_tools;

use crate::compaction::Lookaside;
use crate::config::DispatcherConfig;
use crate::file_access::FileAccess;

/// Everything an executor may touch for one call.
#[derive(Clone)]
pub struct ToolContext {
    /// Agent issuing the call (`main` or a sub-agent name).
    pub agent: String,
    pub files: Arc<dyn FileAccess>,
    pub cancel: CancellationToken,
    pub lookaside: Arc<Lookaside>,
}

impl ToolContext {
    pub fn new(
        agent: impl Into<String>,
        files: Arc<dyn FileAccess>,
        lookaside: Arc<Lookaside>,
    ) -> Self {
        Self {
            agent: agent.into(),
            files,
            cancel: CancellationToken::new(),
            lookaside,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same context for another agent over another file view.
    pub fn for_agent(&self, agent: impl Into<String>, files: Arc<dyn FileAccess>) -> Self {
        Self {
            agent: agent.into(),
            files,
            cancel: self.cancel.child_token(),
            lookaside: Arc::clone(&self.lookaside),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    /// Paths this call mutated.
    pub touched: Vec<String>,
    /// Auto-lint issue count after a mutation.
    pub lint_issues: Option<usize>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            ..Self::default()
        }
    }

    pub fn with_touched(mut self, path: impl Into<String>) -> Self {
        self.touched.push(path.into());
        self
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the call. Failures are reported through
    /// [`ToolOutput::is_error`], never as a panic or an `Err`.
    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Completed,
    /// Cancelled before or during execution.
    Aborted,
    TimedOut,
    /// Unknown tool or malformed input; nothing ran.
    Rejected,
}

#[derive(Clone, Debug)]
pub struct DispatchResult {
    pub call_id: String,
    pub tool: String,
    pub input: Option<ToolInput>,
    pub output: ToolOutput,
    pub status: DispatchStatus,
    pub elapsed: Duration,
}

impl DispatchResult {
    pub fn new(
        call: &ToolCall,
        input: Option<ToolInput>,
        output: ToolOutput,
        status: DispatchStatus,
    ) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            input,
            output,
            status,
            elapsed: Duration::ZERO,
        }
    }

    /// Result for a call that was never started because the run was
    /// cancelled.
    pub fn aborted(call: &ToolCall, reason: &str) -> Self {
        Self::new(
            call,
            call.parse().ok(),
            ToolOutput::error(format!("aborted: {reason}")),
            DispatchStatus::Aborted,
        )
    }

    pub fn is_error(&self) -> bool {
        self.output.is_error
    }

    pub fn is_mutation(&self) -> bool {
        self.input.as_ref().is_some_and(ToolInput::is_mutation)
    }

    /// Transcript block fed back to the model.
    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::tool_result(
            self.call_id.clone(),
            self.output.content.clone(),
            self.output.is_error,
        )
    }
}

pub struct ToolDispatcher {
    executors: HashMap<&'static str, Arc<dyn ToolExecutor>>,
    config: DispatcherConfig,
}

impl ToolDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            executors: HashMap::new(),
            config,
        }
    }

    /// Registers `executor`, replacing any executor with the same name.
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(executor.name(), executor);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.executors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn timeout_for(&self, input: &ToolInput) -> Duration {
        if input.is_orchestration() {
            self.config.orchestration_timeout
        } else {
            self.config.tool_timeout
        }
    }

    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> DispatchResult {
        let started = Instant::now();
        let mut result = self.dispatch_inner(call, ctx).await;
        result.elapsed = started.elapsed();
        debug!(
            tool = %result.tool,
            status = ?result.status,
            is_error = result.output.is_error,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "tool dispatched"
        );
        result
    }

    async fn dispatch_inner(&self, call: &ToolCall, ctx: &ToolContext) -> DispatchResult {
        if ctx.cancel.is_cancelled() {
            return DispatchResult::aborted(call, "execution was cancelled");
        }

        let input = match call.parse() {
            Ok(input) => input,
            Err(err) => {
                let output = ToolOutput::error(err.to_string());
                return DispatchResult::new(call, None, output, DispatchStatus::Rejected);
            }
        };
        let Some(executor) = self.executors.get(input.name()).cloned() else {
            let output =
                ToolOutput::error(format!("tool `{}` is not available here", input.name()));
            return DispatchResult::new(call, Some(input), output, DispatchStatus::Rejected);
        };

        let limit = self.timeout_for(&input);
        let (output, status) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => (
                ToolOutput::error("aborted: execution was cancelled"),
                DispatchStatus::Aborted,
            ),
            result = tokio::time::timeout(limit, executor.execute(&input, ctx)) => match result {
                Ok(output) => (output, DispatchStatus::Completed),
                Err(_) => {
                    warn!(tool = input.name(), timeout_secs = limit.as_secs(), "tool timed out");
                    (
                        ToolOutput::error(format!(
                            "tool `{}` timed out after {}s",
                            input.name(),
                            limit.as_secs()
                        )),
                        DispatchStatus::TimedOut,
                    )
                }
            },
        };
        DispatchResult::new(call, Some(input), output, status)
    }
}
