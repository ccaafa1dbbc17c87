//! The execution driver: one cooperative control loop per execution.
//!
//! [`ExecutionDriver::run`] starts a fresh execution or resumes one from its
//! checkpoint, drives model turns and tool batches until a stop condition,
//! then either hands off to a continuation job (deadline, retryable provider
//! fault) or verifies and completes. Unexpected errors roll back every
//! dirty file and complete the execution as failed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use forge_core::ChangeSet;
use forge_core::CheckpointManager;
use forge_core::CheckpointSnapshot;
use forge_core::Config;
use forge_core::DeadlineTracker;
use forge_core::ExecutionStore;
use forge_core::FileStore;
use forge_core::ForgeErr;
use forge_core::KvStore;
use forge_core::Lookaside;
use forge_core::MicroCompactor;
use forge_core::ToolContext;
use forge_core::ToolDispatcher;
use forge_core::VerificationGate;
use forge_core::WorktreeManager;
use forge_core::file_store::FileBackend;
use forge_core::file_store::FileMirror;
use forge_core::file_store::FileRef;
use forge_core::tools::DispatchResult;
use forge_core::tools::DispatchStatus;
use forge_core::tools::ToolOutput;
use forge_core::tools::builtin_dispatcher;
use forge_core::verification::VerificationInputs;
use forge_core::verification::VerificationOutcome;
use forge_core::worktree::MergeReport;
use forge_protocol::Change;
use forge_protocol::ChangeKind;
use forge_protocol::ContentBlock;
use forge_protocol::Execution;
use forge_protocol::ExecutionPhase;
use forge_protocol::ExecutionStatus;
use forge_protocol::Message;
use forge_protocol::StopReason;
use forge_protocol::Strategy;
use forge_protocol::ToolCall;
use forge_protocol::ToolInput;
use forge_protocol::Usage;
use forge_protocol::ValidationIssue;
use forge_protocol::execution::SubAgentStatus;
use forge_protocol::tools;
use forge_protocol::tools::builtin_tool_definitions;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::batch::BatchRunner;
use crate::jobs::ContinuationJob;
use crate::jobs::JobDispatcher;
use crate::outbox::LoopEvent;
use crate::outbox::Outbox;
use crate::policies::apply_policies;
use crate::policies::expire_exclusions;
use crate::policies::premature_stop;
use crate::provider::ModelProvider;
use crate::provider::ModelRequest;
use crate::provider::ProviderError;
use crate::provider::request_with_fallback;
use crate::state::Exclusion;
use crate::state::FailedMutation;
use crate::state::IterationSummary;
use crate::state::LoopState;
use crate::state::StopCause;
use crate::subagent::DelegateTool;

pub const MAIN_AGENT: &str = "main";

/// Continuation hops an execution may take before a crossed deadline
/// finishes it with whatever it has.
pub const MAX_CONTINUATIONS: u32 = 5;

const MAX_TOKENS: u32 = 16_384;

const SYSTEM_PROMPT: &str = "You are a coding agent working on a theme project. \
Read the files you need, then change them with the file tools. Edit only files you have read. \
Call ask_clarification only when the request cannot be carried out without an answer from the user. \
When the change is complete, reply with a short summary and no tool calls.";

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Forge(#[from] ForgeErr),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Set to resume or continue a known execution.
    pub execution_id: Option<String>,
    pub project_id: String,
    pub user_id: String,
    pub request: String,
    /// Project files known up front, with their content when already
    /// loaded.
    pub files: Vec<(FileRef, Option<String>)>,
    /// Continuation hops already taken.
    pub attempt: u32,
}

impl ExecutionRequest {
    pub fn new(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: None,
            project_id: project_id.into(),
            user_id: user_id.into(),
            request: request.into(),
            files: Vec::new(),
            attempt: 0,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_files(mut self, files: Vec<(FileRef, Option<String>)>) -> Self {
        self.files = files;
        self
    }

    /// Request that continues the execution a job was enqueued for.
    pub fn from_job(job: &ContinuationJob) -> Self {
        Self {
            execution_id: Some(job.execution_id.clone()),
            project_id: job.project_id.clone(),
            user_id: job.user_id.clone(),
            request: job.request.clone(),
            files: Vec::new(),
            attempt: job.attempt,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    /// `None` while the execution continues in the background.
    pub status: Option<ExecutionStatus>,
    pub checkpointed: bool,
    pub continuation_enqueued: bool,
    pub response: String,
    pub changes: Vec<Change>,
    pub validation_issues: Vec<ValidationIssue>,
    pub verification: Option<VerificationOutcome>,
    pub rolled_back: Vec<String>,
    pub persist_failures: Vec<String>,
    pub iterations: u32,
    pub strategy: Strategy,
    pub usage: Usage,
    pub stop: Option<StopCause>,
}

impl ExecutionOutcome {
    fn new(
        run: &Run,
        state: &LoopState,
        status: Option<ExecutionStatus>,
        response: String,
    ) -> Self {
        Self {
            execution_id: run.id.clone(),
            status,
            checkpointed: false,
            continuation_enqueued: false,
            response,
            changes: state.changes.as_slice().to_vec(),
            validation_issues: Vec::new(),
            verification: None,
            rolled_back: Vec::new(),
            persist_failures: run.persist_failures.clone(),
            iterations: state.iteration,
            strategy: state.strategy,
            usage: state.usage,
            stop: state.stop.clone(),
        }
    }
}

/// Why a run hands off to a continuation job.
enum Handoff {
    Deadline,
    Provider(ProviderError),
}

enum Flow {
    Finish,
    Handoff(Handoff),
}

/// Per-execution resources.
struct Run {
    id: String,
    request: ExecutionRequest,
    store: Arc<FileStore>,
    records: ExecutionStore,
    checkpoints: CheckpointManager,
    deadline: DeadlineTracker,
    compactor: MicroCompactor,
    dispatcher: ToolDispatcher,
    worktrees: WorktreeManager,
    tool_ctx: ToolContext,
    /// Cancels in-flight tools of this hop. A child of the driver's token,
    /// also fired when the hard deadline passes mid-batch.
    hop_cancel: CancellationToken,
    /// Messages already appended to the execution record.
    persisted: usize,
    /// Set when persisted messages were changed in place; the next persist
    /// overwrites the record's transcript.
    rewrite_transcript: bool,
    last_text: String,
    persist_failures: Vec<String>,
}

impl Run {
    fn note_persist_failures(&mut self, failed: Vec<String>) -> Vec<String> {
        for id in &failed {
            if !self.persist_failures.contains(id) {
                self.persist_failures.push(id.clone());
            }
        }
        failed
    }
}

pub struct ExecutionDriver {
    config: Config,
    provider: Arc<dyn ModelProvider>,
    kv: Arc<dyn KvStore>,
    backend: Arc<dyn FileBackend>,
    mirror: Option<Arc<dyn FileMirror>>,
    gate: Arc<VerificationGate>,
    jobs: Arc<JobDispatcher>,
    outbox: Outbox,
    cancel: CancellationToken,
}

impl ExecutionDriver {
    pub fn new(
        config: Config,
        provider: Arc<dyn ModelProvider>,
        kv: Arc<dyn KvStore>,
        backend: Arc<dyn FileBackend>,
    ) -> Self {
        let gate = Arc::new(VerificationGate::with_lint_oracle(config.verification.clone()));
        Self {
            config,
            provider,
            kv,
            backend,
            mirror: None,
            gate,
            jobs: Arc::new(JobDispatcher::in_memory()),
            outbox: Outbox::disconnected(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn FileMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_gate(mut self, gate: Arc<VerificationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<JobDispatcher>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn jobs(&self) -> &Arc<JobDispatcher> {
        &self.jobs
    }

    /// Runs one execution hop. Errors are returned only when the execution
    /// record cannot be set up; everything after that ends in an outcome.
    pub async fn run(&self, request: ExecutionRequest) -> forge_core::Result<ExecutionOutcome> {
        let mut run = self.prepare(request);
        let mut state = match self.resume(&mut run).await? {
            Some(state) => state,
            None => self.start(&mut run).await?,
        };

        let outcome = match self.drive(&mut run, &mut state).await {
            Ok(Flow::Finish) => self.finish(&mut run, &mut state).await,
            Ok(Flow::Handoff(reason)) => self.handoff(&mut run, &mut state, reason).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(err) => Ok(self.fail(&mut run, &mut state, err).await),
        }
    }

    fn prepare(&self, request: ExecutionRequest) -> Run {
        let id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut store = FileStore::new(
            request.project_id.clone(),
            Arc::clone(&self.backend),
            self.config.file_store.clone(),
        );
        if let Some(mirror) = &self.mirror {
            store = store.with_mirror(Arc::clone(mirror));
        }
        let store = Arc::new(store);
        store.preload(request.files.iter().cloned());

        let lookaside = Arc::new(Lookaside::new());
        let hop_cancel = self.cancel.child_token();
        let tool_ctx = ToolContext::new(MAIN_AGENT, store.clone(), Arc::clone(&lookaside))
            .with_cancel(hop_cancel.clone());
        let mut dispatcher = builtin_dispatcher(self.config.dispatcher.clone());
        dispatcher.register(Arc::new(DelegateTool::new(
            Arc::clone(&self.provider),
            self.config.clone(),
        )));

        Run {
            id,
            request,
            store,
            records: ExecutionStore::new(Arc::clone(&self.kv), self.config.execution.record_ttl),
            checkpoints: CheckpointManager::new(Arc::clone(&self.kv), &self.config.checkpoint),
            deadline: DeadlineTracker::from_config(&self.config.execution),
            compactor: MicroCompactor::new(self.config.compaction.clone(), lookaside),
            dispatcher,
            worktrees: WorktreeManager::new(),
            tool_ctx,
            hop_cancel,
            persisted: 0,
            rewrite_transcript: false,
            last_text: String::new(),
            persist_failures: Vec::new(),
        }
    }

    async fn start(&self, run: &mut Run) -> forge_core::Result<LoopState> {
        let state = LoopState::new(&run.request.request);
        let mut execution = Execution::new(
            run.id.clone(),
            run.request.project_id.clone(),
            run.request.user_id.clone(),
            run.request.request.clone(),
        );
        execution.status = ExecutionStatus::InProgress;
        execution.messages = state.messages.clone();
        run.records.create(&execution).await?;
        run.persisted = state.messages.len();
        info!(
            execution_id = %run.id,
            strategy = %state.strategy,
            tier = ?state.tier,
            intent = ?state.intent,
            "execution started"
        );
        Ok(state)
    }

    /// Rebuilds loop state from the checkpoint, if there is a usable one.
    async fn resume(&self, run: &mut Run) -> forge_core::Result<Option<LoopState>> {
        let record = match run.checkpoints.load(&run.id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(err) if err.is_checkpoint_corruption() => {
                warn!(execution_id = %run.id, "discarding checkpoint: {err}");
                run.checkpoints.clear(&run.id).await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let Some(execution) = run.records.load(&run.id).await? else {
            warn!(execution_id = %run.id, "checkpoint has no execution record, starting fresh");
            run.checkpoints.clear(&run.id).await?;
            return Ok(None);
        };

        let store = &run.store;
        for change in &record.accumulated_changes {
            store.register(FileRef::new(change.file_id.clone(), change.file_name.clone()));
        }
        let missing = store.hydrate_dirty(&record.dirty_file_ids).await?;
        for change in &record.accumulated_changes {
            let original = match change.kind {
                ChangeKind::Create => None,
                ChangeKind::Modify | ChangeKind::Delete => Some(change.original_content.clone()),
            };
            store.seed_original(&change.file_name, original);
        }
        for path in &record.read_files {
            store.mark_read(path);
        }

        let mut state = LoopState::new(&execution.request);
        state.iteration = record.iteration;
        state.phase = record.phase;
        state.strategy = record.strategy;
        state.successful_mutations = record.accumulated_changes.len() as u32;
        state.changes = ChangeSet::from_changes(record.accumulated_changes);
        state.completed_sub_agents = record.completed_sub_agents;
        let messages = run.records.messages(&run.id).await?;
        if !messages.is_empty() {
            state.messages = messages;
        }
        run.persisted = state.messages.len();
        let edited = if state.changes.is_empty() {
            "none".to_string()
        } else {
            state.changes.file_names().join(", ")
        };
        state.push_directive(format!(
            "[resumed] This execution was checkpointed after iteration {} and continues now. Files already changed: {edited}. Continue where you left off.",
            state.iteration
        ));
        run.rewrite_transcript = true;
        run.records
            .set_status(&run.id, ExecutionStatus::InProgress)
            .await?;
        info!(
            execution_id = %run.id,
            iteration = state.iteration,
            attempt = run.request.attempt,
            dirty_files = record.dirty_file_ids.len(),
            missing = missing.len(),
            "execution resumed from checkpoint"
        );
        Ok(Some(state))
    }

    fn emit(&self, event: LoopEvent) {
        self.outbox.emit(event);
    }

    async fn drive(&self, run: &mut Run, state: &mut LoopState) -> Result<Flow, LoopError> {
        let policies = self.config.policies.clone();
        loop {
            if self.cancel.is_cancelled() {
                info!(execution_id = %run.id, "execution cancelled");
                state.stop = Some(StopCause::Cancelled);
                return Ok(Flow::Finish);
            }
            if run.deadline.soft_deadline_crossed() {
                return Ok(deadline_flow(run, state));
            }
            let profile = state.profile();
            if state.iteration >= profile.max_iterations {
                info!(
                    execution_id = %run.id,
                    iteration = state.iteration,
                    "iteration ceiling reached"
                );
                state.stop = Some(StopCause::IterationCeiling);
                return Ok(Flow::Finish);
            }

            state.iteration += 1;
            self.emit(LoopEvent::IterationStarted {
                execution_id: run.id.clone(),
                iteration: state.iteration,
            });
            expire_exclusions(state, &policies);
            state.phase = if !state.changes.is_empty() {
                ExecutionPhase::ApplyPatch
            } else if state.iteration == 1 {
                ExecutionPhase::ResolveIntent
            } else {
                ExecutionPhase::BuildPatch
            };
            self.manage_context(run, state);
            let report = run.compactor.compact(&mut state.messages);
            if report.compacted > 0 {
                debug!(
                    execution_id = %run.id,
                    compacted = report.compacted,
                    bytes_saved = report.bytes_saved(),
                    "compacted tool results"
                );
            }

            let request = ModelRequest {
                agent: MAIN_AGENT.to_string(),
                system: format!("{SYSTEM_PROMPT}\nStrategy: {}.", state.strategy),
                messages: state.messages.clone(),
                tools: builtin_tool_definitions(state.delegation_allowed()),
                max_tokens: MAX_TOKENS,
            };
            let idle_timeout = self.config.execution.stream_idle_timeout;
            let pending = request_with_fallback(self.provider.as_ref(), &request, idle_timeout);
            let Ok(response) = tokio::time::timeout(run.deadline.remaining(), pending).await else {
                warn!(
                    execution_id = %run.id,
                    iteration = state.iteration,
                    elapsed_ms = run.deadline.elapsed().as_millis() as u64,
                    "wall clock ran out waiting for the model"
                );
                state.iteration -= 1;
                return Ok(deadline_flow(run, state));
            };
            let response = match response {
                Ok(response) => response,
                Err(err) if err.is_retryable() => {
                    warn!(
                        execution_id = %run.id,
                        iteration = state.iteration,
                        "retryable provider fault: {err}"
                    );
                    state.iteration -= 1;
                    return Ok(Flow::Handoff(Handoff::Provider(err)));
                }
                Err(err) => return Err(err.into()),
            };

            state.usage.add(response.usage);
            let calls = response.tool_calls();
            let stop_reason = response.stop_reason;
            let text = response.text();
            if !text.trim().is_empty() {
                run.last_text = text;
            }
            state.messages.push(response.into_message());

            if calls.is_empty() {
                if let Some(nudge) = premature_stop(state, &policies) {
                    info!(
                        execution_id = %run.id,
                        nudges = state.premature_nudges,
                        "premature stop, nudging"
                    );
                    state.push_directive(nudge);
                    self.persist_messages(run, state).await?;
                    continue;
                }
                self.persist_messages(run, state).await?;
                return Ok(Flow::Finish);
            }

            if let Some((index, question)) = clarification_request(&calls) {
                self.answer_clarification(state, &calls, index, question);
                self.persist_messages(run, state).await?;
                return Ok(Flow::Finish);
            }

            let from_strategy = state.strategy;
            let summary = self.run_tools(run, state, &calls).await?;

            let outcome = apply_policies(state, &summary, &policies);
            if let Some(to) = outcome.escalated_to {
                self.emit(LoopEvent::StrategyEscalated {
                    execution_id: run.id.clone(),
                    from: from_strategy,
                    to,
                });
            }
            for directive in outcome.directives {
                state.push_directive(directive);
            }
            if state.stop.is_none() && state.tool_calls >= state.profile().tool_budget {
                info!(
                    execution_id = %run.id,
                    tool_calls = state.tool_calls,
                    "tool budget exhausted"
                );
                state.stop = Some(StopCause::ToolBudget);
            }
            self.persist_messages(run, state).await?;

            let every = self.config.checkpoint.every_iterations;
            if every > 0 && state.iteration % every == 0 {
                let failed = run.store.flush().await;
                self.note_failures(run, failed);
                self.save_checkpoint(run, state).await?;
            }

            if state.is_stopped() || stop_reason != StopReason::ToolUse {
                return Ok(Flow::Finish);
            }
        }
    }

    /// Injects the memory anchor as usage nears the context threshold and
    /// clears the transcript down to the anchor once it is crossed.
    fn manage_context(&self, run: &mut Run, state: &mut LoopState) {
        let threshold = self.config.execution.context_clear_threshold;
        if threshold == 0 {
            return;
        }
        let used = state.usage.total().saturating_sub(state.context_base);
        if used >= threshold {
            let anchor = state.memory_anchor(&run.request.request, &run.store.reads());
            info!(execution_id = %run.id, used, "context threshold crossed, clearing transcript");
            state.messages = vec![Message::user_text(format!(
                "{}\n\n{anchor}\nThe earlier transcript was cleared. Continue from this summary.",
                run.request.request
            ))];
            state.context_base = state.usage.total();
            state.anchor_injected = false;
            run.rewrite_transcript = true;
        } else if !state.anchor_injected
            && used as f64 >= threshold as f64 * self.config.execution.anchor_ratio
        {
            let anchor = state.memory_anchor(&run.request.request, &run.store.reads());
            debug!(execution_id = %run.id, used, "injecting memory anchor");
            state.push_directive(anchor);
            state.anchor_injected = true;
            run.rewrite_transcript = true;
        }
    }

    fn answer_clarification(
        &self,
        state: &mut LoopState,
        calls: &[ToolCall],
        index: usize,
        question: String,
    ) {
        let results: Vec<DispatchResult> = calls
            .iter()
            .enumerate()
            .map(|(position, call)| {
                if position == index {
                    DispatchResult::new(
                        call,
                        call.parse().ok(),
                        ToolOutput::success("The question was passed to the user."),
                        DispatchStatus::Completed,
                    )
                } else {
                    DispatchResult::aborted(call, "a clarification was requested")
                }
            })
            .collect();
        state.tool_calls += calls.len() as u32;
        state
            .messages
            .push(Message::tool_results(results.iter().map(DispatchResult::to_block).collect()));
        info!(%question, "clarification requested, stopping");
        state.stop = Some(StopCause::Clarification { question });
    }

    /// Reason to refuse `call` before it reaches the scheduler.
    fn refusal(&self, state: &LoopState, call: &ToolCall) -> Option<String> {
        if state.tool_calls > state.profile().tool_budget {
            return Some(format!(
                "The tool budget of {} calls for this execution is exhausted.",
                state.profile().tool_budget
            ));
        }
        let input = call.parse().ok()?;
        if input.is_orchestration() && !state.delegation_allowed() {
            return Some(
                "Delegation is disabled for this execution. Make the edits yourself.".to_string(),
            );
        }
        if input.is_mutation() {
            for path in input.target_paths() {
                if state.is_excluded(&path, &call.name) {
                    let alternative = if call.name == tools::WRITE_FILE {
                        tools::EDIT_FILE
                    } else {
                        tools::WRITE_FILE
                    };
                    return Some(format!(
                        "{} is disabled for {path} after repeated failures. Use {alternative} with the full intended content instead.",
                        call.name
                    ));
                }
            }
        }
        None
    }

    async fn run_tools(
        &self,
        run: &mut Run,
        state: &mut LoopState,
        calls: &[ToolCall],
    ) -> Result<IterationSummary, LoopError> {
        let mut refused: BTreeMap<usize, DispatchResult> = BTreeMap::new();
        let mut runnable: Vec<(usize, ToolCall)> = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            state.tool_calls += 1;
            match self.refusal(state, call) {
                Some(reason) => {
                    debug!(
                        execution_id = %run.id,
                        tool = %call.name,
                        "refused tool call: {reason}"
                    );
                    let output = ToolOutput::error(reason);
                    let input = call.parse().ok();
                    let result = DispatchResult::new(call, input, output, DispatchStatus::Rejected);
                    refused.insert(index, result);
                }
                None => runnable.push((index, call.clone())),
            }
        }

        let batch_calls: Vec<ToolCall> = runnable.iter().map(|(_, call)| call.clone()).collect();
        let runner = BatchRunner {
            dispatcher: &run.dispatcher,
            store: &run.store,
            worktrees: &run.worktrees,
            ctx: &run.tool_ctx,
            fan_out: self.config.scheduler.fan_out,
        };
        let pending = runner.run(&batch_calls);
        tokio::pin!(pending);
        let batch = tokio::select! {
            batch = &mut pending => batch?,
            _ = tokio::time::sleep(run.deadline.remaining()) => {
                warn!(
                    execution_id = %run.id,
                    iteration = state.iteration,
                    "wall clock ran out during the tool batch"
                );
                run.hop_cancel.cancel();
                pending.await?
            }
        };

        let mut ordered = refused;
        for ((index, _), result) in runnable.iter().zip(batch.results.iter().cloned()) {
            ordered.insert(*index, result);
        }
        let results: Vec<DispatchResult> = ordered.into_values().collect();

        let before = state.changes.clone();
        let mut summary = IterationSummary {
            tool_calls: results.len(),
            ..IterationSummary::default()
        };
        for result in &results {
            self.emit(LoopEvent::ToolFinished {
                execution_id: run.id.clone(),
                tool: result.tool.clone(),
                is_error: result.is_error(),
                elapsed_ms: result.elapsed.as_millis() as u64,
            });
            let Some(input) = result.input.as_ref() else {
                continue;
            };
            if input.is_read_only() {
                summary.read_only_calls += 1;
            }
            if let ToolInput::ReadFile { path } = input {
                if !result.is_error() && run.compactor.note_read(path) {
                    self.emit(LoopEvent::CompactedReread {
                        execution_id: run.id.clone(),
                        path: path.clone(),
                    });
                }
            }
            if result.is_mutation() && result.status != DispatchStatus::Rejected {
                let Some(path) = input.target_paths().into_iter().next() else {
                    continue;
                };
                if result.is_error() {
                    let old_text = match input {
                        ToolInput::EditFile { old_text, .. } => Some(old_text.clone()),
                        _ => None,
                    };
                    let current_content = run.store.peek(&path).await.ok().flatten();
                    summary.failed_mutations.push(FailedMutation {
                        path,
                        tool: result.tool.clone(),
                        old_text,
                        current_content,
                    });
                } else {
                    state.successful_mutations += 1;
                    summary.successful_mutations.push(Exclusion {
                        path,
                        tool: result.tool.clone(),
                    });
                }
            }
            if input.is_orchestration() && result.status != DispatchStatus::Rejected {
                let agent = format!("delegate-{}", result.call_id);
                let status = if result.is_error() {
                    SubAgentStatus::Failed
                } else {
                    state.completed_sub_agents.push(agent.clone());
                    SubAgentStatus::Completed
                };
                run.records.mark_sub_agent(&run.id, &agent, status).await?;
            }
        }

        let mut blocks: Vec<ContentBlock> = results.iter().map(DispatchResult::to_block).collect();
        if let Some(report) = &batch.merge {
            for conflict in &report.conflicts {
                self.emit(LoopEvent::ConflictDetected {
                    execution_id: run.id.clone(),
                    path: conflict.path.clone(),
                });
            }
            if let Some(directive) = report.conflict_directive() {
                blocks.push(ContentBlock::text(directive));
            }
        }
        state.messages.push(Message::tool_results(blocks));
        for conflict in run.store.take_conflicts() {
            self.emit(LoopEvent::ConflictDetected {
                execution_id: run.id.clone(),
                path: conflict.path,
            });
        }

        self.sync_changes(run, state, &batch.touched_by).await?;
        summary.net_new_change = state.changes != before;
        debug!(
            execution_id = %run.id,
            iteration = state.iteration,
            calls = summary.tool_calls,
            changes = state.changes.len(),
            merged = batch.merge.as_ref().map_or(0, |report: &MergeReport| report.applied.len()),
            "tool batch finished"
        );
        Ok(summary)
    }

    /// Brings the change set in line with the store's dirty files.
    async fn sync_changes(
        &self,
        run: &Run,
        state: &mut LoopState,
        touched_by: &BTreeMap<String, String>,
    ) -> forge_core::Result<()> {
        let dirty: BTreeSet<String> = run.store.dirty_paths().into_iter().collect();
        for name in state.changes.file_names() {
            if !dirty.contains(&name) {
                state.changes.remove(&name);
            }
        }
        for path in dirty {
            let Some(original) = run.store.original(&path) else {
                continue;
            };
            let current = run.store.peek(&path).await?;
            let kind = match (&original, &current) {
                (None, None) => {
                    state.changes.remove(&path);
                    continue;
                }
                (None, Some(_)) => ChangeKind::Create,
                (Some(_), None) => ChangeKind::Delete,
                (Some(_), Some(_)) => ChangeKind::Modify,
            };
            let agent = touched_by
                .get(&path)
                .cloned()
                .or_else(|| state.changes.get(&path).map(|change| change.agent.clone()))
                .unwrap_or_else(|| MAIN_AGENT.to_string());
            let file_id = run.store.file_ref(&path).map_or_else(|| path.clone(), |file| file.id);
            state.changes.record(Change {
                file_id,
                file_name: path,
                original_content: original.unwrap_or_default(),
                proposed_content: current.unwrap_or_default(),
                rationale: run.request.request.clone(),
                agent,
                kind,
            });
        }
        state.changes.prune_noops();
        Ok(())
    }

    async fn persist_messages(&self, run: &mut Run, state: &LoopState) -> forge_core::Result<()> {
        if run.rewrite_transcript {
            run.records.replace_messages(&run.id, &state.messages).await?;
            run.rewrite_transcript = false;
        } else if run.persisted < state.messages.len() {
            run.records
                .append_messages(&run.id, &state.messages[run.persisted..])
                .await?;
        }
        run.persisted = state.messages.len();
        Ok(())
    }

    fn note_failures(&self, run: &mut Run, failed: Vec<String>) {
        let failed = run.note_persist_failures(failed);
        if !failed.is_empty() {
            self.emit(LoopEvent::PersistFailure {
                execution_id: run.id.clone(),
                file_ids: failed,
            });
        }
    }

    async fn save_checkpoint(&self, run: &Run, state: &LoopState) -> forge_core::Result<()> {
        let snapshot = CheckpointSnapshot {
            phase: state.phase,
            iteration: state.iteration,
            dirty_file_ids: run.store.dirty_ids(),
            accumulated_changes: state.changes.as_slice().to_vec(),
            completed_sub_agents: state.completed_sub_agents.clone(),
            read_files: run.store.reads().into_iter().collect(),
            strategy: state.strategy,
        };
        let record = run.checkpoints.save(&run.id, snapshot).await?;
        self.emit(LoopEvent::CheckpointSaved {
            execution_id: run.id.clone(),
            iteration: record.iteration,
            dirty_files: record.dirty_file_ids.len(),
        });
        Ok(())
    }

    /// Checkpoints and enqueues a continuation instead of blocking.
    async fn handoff(
        &self,
        run: &mut Run,
        state: &mut LoopState,
        reason: Handoff,
    ) -> Result<ExecutionOutcome, LoopError> {
        let failed = run.store.flush().await;
        self.note_failures(run, failed);
        self.save_checkpoint(run, state).await?;
        self.persist_messages(run, state).await?;

        let job = ContinuationJob::new(
            run.id.clone(),
            run.request.project_id.clone(),
            run.request.user_id.clone(),
            run.request.request.clone(),
            run.request.attempt + 1,
        );
        let enqueued = match self.jobs.enqueue(job.clone()).await {
            Ok(()) => {
                self.jobs.trigger(job);
                true
            }
            Err(err) => {
                warn!(execution_id = %run.id, "failed to enqueue continuation: {err:#}");
                false
            }
        };
        let why = match &reason {
            Handoff::Deadline => format!(
                "the time budget of {}s was nearly used up",
                self.config.execution.wall_clock.as_secs()
            ),
            Handoff::Provider(err) => format!("the model request failed ({err})"),
        };
        info!(
            execution_id = %run.id,
            iteration = state.iteration,
            enqueued,
            "execution handed off: {why}"
        );
        self.emit(LoopEvent::ExecutionFinished {
            execution_id: run.id.clone(),
            status: None,
            iterations: state.iteration,
        });

        let response = if enqueued {
            format!(
                "Progress was checkpointed after iteration {} because {why}. The execution continues in the background.",
                state.iteration
            )
        } else {
            format!(
                "Progress was checkpointed after iteration {} because {why}. Resume execution {} to continue.",
                state.iteration, run.id
            )
        };
        let mut outcome = ExecutionOutcome::new(run, state, None, response);
        outcome.checkpointed = true;
        outcome.continuation_enqueued = enqueued;
        Ok(outcome)
    }

    /// Verifies accumulated changes and completes the execution record.
    async fn finish(
        &self,
        run: &mut Run,
        state: &mut LoopState,
    ) -> Result<ExecutionOutcome, LoopError> {
        state.phase = ExecutionPhase::Verify;
        let failed = run.store.flush().await;
        self.note_failures(run, failed);
        self.sync_changes(run, state, &BTreeMap::new()).await?;

        let mut status = ExecutionStatus::Completed;
        let mut rolled_back = Vec::new();
        let verification = if state.changes.is_empty() {
            None
        } else {
            let inputs = VerificationInputs {
                project_id: run.request.project_id.clone(),
                changes: state.changes.as_slice().to_vec(),
                baseline: run.store.baseline_snapshot().await?,
                reads: run.store.reads(),
            };
            Some(self.gate.verify(inputs))
        };
        if let Some(verification) = &verification {
            let discarded: Vec<String> = verification
                .discarded
                .iter()
                .map(|change| change.file_name.clone())
                .collect();
            if !discarded.is_empty() {
                rolled_back = run.store.rollback_paths(&discarded).await?;
            }
            state.changes = ChangeSet::from_changes(verification.kept.clone());
            if !verification.changes_kept {
                status = ExecutionStatus::Failed;
            } else if !state.changes.is_empty() {
                self.gate.invalidate_project(&run.request.project_id);
            }
            let failed = run.store.flush().await;
            self.note_failures(run, failed);
        }

        state.phase = ExecutionPhase::Complete;
        run.records.clear_changes(&run.id).await?;
        let mut by_agent: BTreeMap<String, Vec<Change>> = BTreeMap::new();
        for change in state.changes.iter() {
            by_agent.entry(change.agent.clone()).or_default().push(change.clone());
        }
        for (agent, changes) in by_agent {
            run.records.record_changes(&run.id, &agent, changes).await?;
        }
        self.persist_messages(run, state).await?;
        run.records.complete(&run.id, status).await?;
        run.checkpoints.clear(&run.id).await?;
        self.emit(LoopEvent::ExecutionFinished {
            execution_id: run.id.clone(),
            status: Some(status),
            iterations: state.iteration,
        });
        info!(
            execution_id = %run.id,
            status = %status,
            changes = state.changes.len(),
            iterations = state.iteration,
            "execution finished"
        );

        let response = compose_response(run, state, verification.as_ref(), &rolled_back);
        let mut outcome = ExecutionOutcome::new(run, state, Some(status), response);
        if let Some(verification) = verification {
            outcome.validation_issues = verification.issues.clone();
            outcome.verification = Some(verification);
        }
        outcome.rolled_back = rolled_back;
        Ok(outcome)
    }

    /// Rolls back every dirty file and completes the execution as failed.
    async fn fail(&self, run: &mut Run, state: &mut LoopState, err: LoopError) -> ExecutionOutcome {
        error!(execution_id = %run.id, iteration = state.iteration, "execution failed: {err}");
        let rolled_back = match run.store.rollback().await {
            Ok(paths) => paths,
            Err(rollback_err) => {
                warn!(execution_id = %run.id, "rollback failed: {rollback_err}");
                Vec::new()
            }
        };
        let failed = run.store.flush().await;
        self.note_failures(run, failed);
        state.changes.clear();
        if let Err(record_err) = run.records.clear_changes(&run.id).await {
            warn!(execution_id = %run.id, "could not clear recorded changes: {record_err}");
        }
        if let Err(record_err) = run.records.complete(&run.id, ExecutionStatus::Failed).await {
            warn!(execution_id = %run.id, "could not complete execution record: {record_err}");
        }
        if let Err(checkpoint_err) = run.checkpoints.clear(&run.id).await {
            warn!(execution_id = %run.id, "could not clear checkpoint: {checkpoint_err}");
        }
        self.emit(LoopEvent::ExecutionFinished {
            execution_id: run.id.clone(),
            status: Some(ExecutionStatus::Failed),
            iterations: state.iteration,
        });

        let mut response = format!("The execution failed: {err}");
        if !rolled_back.is_empty() {
            response.push_str(&format!("\nRolled back: {}", rolled_back.join(", ")));
        }
        let mut outcome =
            ExecutionOutcome::new(run, state, Some(ExecutionStatus::Failed), response);
        outcome.rolled_back = rolled_back;
        outcome
    }
}

/// Hands off when the wall clock runs out, unless the continuation hops are
/// used up.
fn deadline_flow(run: &Run, state: &mut LoopState) -> Flow {
    if run.request.attempt >= MAX_CONTINUATIONS {
        warn!(
            execution_id = %run.id,
            attempt = run.request.attempt,
            "deadline crossed with no continuation hops left"
        );
        state.stop = Some(StopCause::Deadline);
        return Flow::Finish;
    }
    Flow::Handoff(Handoff::Deadline)
}

/// Position and question of the first well-formed `ask_clarification` call.
fn clarification_request(calls: &[ToolCall]) -> Option<(usize, String)> {
    calls
        .iter()
        .enumerate()
        .find_map(|(index, call)| match call.parse() {
            Ok(ToolInput::AskClarification { question }) => Some((index, question)),
            _ => None,
        })
}

fn compose_response(
    run: &Run,
    state: &LoopState,
    verification: Option<&VerificationOutcome>,
    rolled_back: &[String],
) -> String {
    let mut parts = Vec::new();
    if !run.last_text.trim().is_empty() {
        parts.push(run.last_text.trim().to_string());
    }
    if let Some(question) = state.clarification() {
        parts.push(format!("Question: {question}"));
    }
    if let Some(explanation) = verification.and_then(|outcome| outcome.explanation.clone()) {
        parts.push(explanation);
    }
    if !rolled_back.is_empty() {
        parts.push(format!("Rolled back: {}", rolled_back.join(", ")));
    }
    match &state.stop {
        Some(StopCause::Stagnated) => {
            parts.push(
                "Stopped after repeated iterations without progress; \
                 the changes so far are a partial result."
                    .to_string(),
            );
        }
        Some(StopCause::IterationCeiling) => {
            parts.push(format!(
                "Stopped at the iteration limit of the {} strategy.",
                state.strategy
            ));
        }
        Some(StopCause::ToolBudget) => {
            parts.push("Stopped after using the whole tool budget.".to_string());
        }
        Some(StopCause::Deadline) => {
            parts.push(
                "Stopped because the execution ran out of time and continuation hops.".to_string(),
            );
        }
        Some(StopCause::Cancelled) => parts.push("The execution was cancelled.".to_string()),
        Some(StopCause::Clarification { .. }) | None => {}
    }
    if !run.persist_failures.is_empty() {
        parts.push(format!(
            "Warning: {} file(s) could not be saved durably and may be out of date in storage: {}",
            run.persist_failures.len(),
            run.persist_failures.join(", ")
        ));
    }
    if parts.is_empty() {
        "Done.".to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixtureProvider;
    use forge_core::MemoryStore;
    use forge_core::file_store::InMemoryFileBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const HEADER: &str = "sections/header.liquid";

    fn driver(script: serde_json::Value, backend: Arc<InMemoryFileBackend>) -> ExecutionDriver {
        let provider = FixtureProvider::from_json_str(&script.to_string()).unwrap();
        ExecutionDriver::new(
            Config::default(),
            Arc::new(provider),
            Arc::new(MemoryStore::new()),
            backend,
        )
    }

    fn header_backend() -> Arc<InMemoryFileBackend> {
        Arc::new(InMemoryFileBackend::with_files([(
            HEADER,
            "<header style=\"color: red\">{{ shop.name }}</header>",
        )]))
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("p1", "u1", "fix header color")
            .with_files(vec![(FileRef::from_path(HEADER), None)])
    }

    #[tokio::test]
    async fn test_clarification_aborts_remaining_calls() {
        let driver = driver(
            json!({"turns": [
                {"tool_calls": [
                    {"id": "q1", "name": "ask_clarification", "input": {"question": "Which header?"}},
                    {"id": "e1", "name": "edit_file",
                     "input": {"path": HEADER, "old_text": "red", "new_text": "blue"}}
                ]}
            ]}),
            header_backend(),
        );
        let outcome = driver.run(request()).await.unwrap();
        assert_eq!(outcome.status, Some(ExecutionStatus::Completed));
        assert_eq!(
            outcome.stop,
            Some(StopCause::Clarification {
                question: "Which header?".to_string()
            })
        );
        assert!(outcome.changes.is_empty());
        assert!(outcome.response.contains("Which header?"));
    }

    #[tokio::test]
    async fn test_premature_stop_is_nudged_before_accepting() {
        let driver = driver(
            json!({"turns": [
                {"text": "Looks fine."},
                {"tool_calls": [{"name": "read_file", "input": {"path": HEADER}}]},
                {"tool_calls": [{"name": "edit_file",
                  "input": {"path": HEADER, "old_text": "red", "new_text": "blue"}}]},
                {"text": "Changed the header color to blue."}
            ]}),
            header_backend(),
        );
        let outcome = driver.run(request()).await.unwrap();
        assert_eq!(outcome.status, Some(ExecutionStatus::Completed));
        assert_eq!(outcome.iterations, 4);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].agent, MAIN_AGENT);
        assert!(outcome.response.starts_with("Changed the header color"));
    }

    #[tokio::test]
    async fn test_fatal_provider_error_rolls_back_edits() {
        let backend = header_backend();
        let driver = driver(
            json!({"turns": [
                {"tool_calls": [{"name": "read_file", "input": {"path": HEADER}}]},
                {"tool_calls": [{"name": "edit_file",
                  "input": {"path": HEADER, "old_text": "red", "new_text": "blue"}}]},
                {"provider_error": "fatal"}
            ]}),
            Arc::clone(&backend),
        );
        let outcome = driver.run(request()).await.unwrap();
        assert_eq!(outcome.status, Some(ExecutionStatus::Failed));
        assert_eq!(outcome.rolled_back, vec![HEADER.to_string()]);
        assert!(outcome.changes.is_empty());
        assert!(outcome.response.starts_with("The execution failed"));
        assert_eq!(
            backend.content(HEADER).as_deref(),
            Some("<header style=\"color: red\">{{ shop.name }}</header>")
        );
    }

    #[tokio::test]
    async fn test_retryable_provider_error_hands_off() {
        let driver = driver(
            json!({"turns": [
                {"tool_calls": [{"name": "read_file", "input": {"path": HEADER}}]},
                {"provider_error": "network"}
            ]}),
            header_backend(),
        );
        let outcome = driver.run(request()).await.unwrap();
        assert_eq!(outcome.status, None);
        assert!(outcome.checkpointed);
        assert!(outcome.continuation_enqueued);
        assert_eq!(outcome.iterations, 1);
        let job = driver.jobs().queue().take(&outcome.execution_id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(job.request, "fix header color");
    }

    #[tokio::test]
    async fn test_cleared_transcript_survives_handoff_and_resume() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let backend = header_backend();
        let mut config = Config::default();
        config.execution.context_clear_threshold = 1_000;
        let hop = |script: serde_json::Value| {
            let provider = FixtureProvider::from_json_str(&script.to_string()).unwrap();
            ExecutionDriver::new(
                config.clone(),
                Arc::new(provider),
                Arc::clone(&kv),
                Arc::clone(&backend) as Arc<dyn FileBackend>,
            )
        };

        let first = hop(json!({"turns": [
            {"usage": {"input_tokens": 1_200, "output_tokens": 0},
             "tool_calls": [{"name": "read_file", "input": {"path": HEADER}}]},
            {"provider_error": "network"}
        ]}));
        let outcome = first.run(request()).await.unwrap();
        assert!(outcome.checkpointed);

        let records = ExecutionStore::new(Arc::clone(&kv), config.execution.record_ttl);
        let transcript = records.messages(&outcome.execution_id).await.unwrap();
        assert_eq!(transcript.len(), 1);
        assert!(transcript[0].text().contains("The earlier transcript was cleared"));

        let job = first.jobs().queue().take(&outcome.execution_id).await.unwrap().unwrap();
        let second = hop(json!({"turns": [
            {"tool_calls": [{"name": "edit_file",
              "input": {"path": HEADER, "old_text": "red", "new_text": "blue"}}]},
            {"text": "Changed the header color to blue."}
        ]}));
        let resumed = second
            .run(
                ExecutionRequest::from_job(&job)
                    .with_files(vec![(FileRef::from_path(HEADER), None)]),
            )
            .await
            .unwrap();
        assert_eq!(resumed.status, Some(ExecutionStatus::Completed));
        assert_eq!(resumed.changes.len(), 1);

        let execution = records.load(&outcome.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.messages.len(), 4);
        let opening = execution.messages[0].text();
        assert!(opening.contains("The earlier transcript was cleared"));
        assert!(opening.contains("[resumed]"));
        assert!(
            execution
                .messages
                .iter()
                .all(|message| message.tool_uses().all(|(_, name, _)| name != tools::READ_FILE))
        );
    }

    #[test]
    fn test_excluded_tool_and_delegation_are_refused() {
        let driver = driver(json!({"turns": []}), header_backend());
        let mut state = LoopState::new("fix header color");
        state.exclusions.insert(
            Exclusion {
                path: HEADER.to_string(),
                tool: tools::EDIT_FILE.to_string(),
            },
            1,
        );
        let edit = ToolCall::new(
            "e1",
            tools::EDIT_FILE,
            json!({"path": HEADER, "old_text": "red", "new_text": "blue"}),
        );
        let refusal = driver.refusal(&state, &edit).unwrap();
        assert!(refusal.contains("Use write_file"));

        let write = ToolCall::new("w1", tools::WRITE_FILE, json!({"path": HEADER, "content": "x"}));
        assert_eq!(driver.refusal(&state, &write), None);

        let delegate =
            ToolCall::new("d1", tools::DELEGATE, json!({"task": "t", "files": [HEADER]}));
        assert!(driver.refusal(&state, &delegate).unwrap().contains("Delegation is disabled"));

        state.tool_calls = state.profile().tool_budget + 1;
        assert!(driver.refusal(&state, &write).unwrap().contains("tool budget"));
    }
}
