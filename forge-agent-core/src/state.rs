//! Mutable state of one control loop run.
//!
//! Every step function of the loop takes `&mut LoopState`; nothing else
//! holds loop-local state.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use forge_core::ChangeSet;
use forge_protocol::ContentBlock;
use forge_protocol::ExecutionPhase;
use forge_protocol::Message;
use forge_protocol::Role;
use forge_protocol::Strategy;
use forge_protocol::Usage;
use serde::Serialize;

use crate::strategy::ComplexityTier;
use crate::strategy::Intent;
use crate::strategy::StrategyProfile;

/// Why the loop stopped before the model ended its turn on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopCause {
    /// The model asked the user a question, or the loop gave up waiting
    /// for an edit and asks on its behalf.
    Clarification { question: String },
    /// Rethink directives were exhausted without further progress.
    Stagnated,
    IterationCeiling,
    ToolBudget,
    /// Wall-clock budget spent and no continuation hops left.
    Deadline,
    Cancelled,
}

/// A tool disabled for one file after repeated failed mutations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Exclusion {
    pub path: String,
    pub tool: String,
}

/// What one iteration's tool batch did, as seen by the policies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IterationSummary {
    pub tool_calls: usize,
    pub read_only_calls: usize,
    pub successful_mutations: Vec<Exclusion>,
    pub failed_mutations: Vec<FailedMutation>,
    /// The accumulated change set differs from the previous iteration.
    pub net_new_change: bool,
}

impl IterationSummary {
    pub fn all_read_only(&self) -> bool {
        self.tool_calls > 0 && self.read_only_calls == self.tool_calls
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedMutation {
    pub path: String,
    pub tool: String,
    /// Text the failed edit tried to replace, if any.
    pub old_text: Option<String>,
    /// Current file content, used to build a snippet.
    pub current_content: Option<String>,
}

#[derive(Debug)]
pub struct LoopState {
    pub iteration: u32,
    pub phase: ExecutionPhase,
    pub strategy: Strategy,
    pub tier: ComplexityTier,
    pub intent: Intent,
    pub messages: Vec<Message>,
    pub changes: ChangeSet,
    pub usage: Usage,
    /// Token total at the last context clear.
    pub context_base: u64,
    pub tool_calls: u32,
    pub successful_mutations: u32,
    pub consecutive_read_only: u32,
    pub read_only_nudges: u32,
    pub iterations_since_change: u32,
    pub rethinks: u32,
    pub premature_nudges: u32,
    pub edit_sla_forced: bool,
    pub stalled_iterations: u32,
    pub escalations: u32,
    pub mutation_failures: BTreeMap<String, u32>,
    /// Disabled tool per file, with the iteration it was disabled at.
    pub exclusions: BTreeMap<Exclusion, u32>,
    pub anchor_injected: bool,
    pub delegation_disabled: bool,
    pub completed_sub_agents: Vec<String>,
    pub stop: Option<StopCause>,
}

impl LoopState {
    pub fn new(request: &str) -> Self {
        let tier = ComplexityTier::classify(request);
        Self {
            iteration: 0,
            phase: ExecutionPhase::ResolveIntent,
            strategy: tier.initial_strategy(),
            tier,
            intent: Intent::classify(request),
            messages: vec![Message::user_text(request)],
            changes: ChangeSet::new(),
            usage: Usage::default(),
            context_base: 0,
            tool_calls: 0,
            successful_mutations: 0,
            consecutive_read_only: 0,
            read_only_nudges: 0,
            iterations_since_change: 0,
            rethinks: 0,
            premature_nudges: 0,
            edit_sla_forced: false,
            stalled_iterations: 0,
            escalations: 0,
            mutation_failures: BTreeMap::new(),
            exclusions: BTreeMap::new(),
            anchor_injected: false,
            delegation_disabled: false,
            completed_sub_agents: Vec::new(),
            stop: None,
        }
    }

    pub fn profile(&self) -> StrategyProfile {
        StrategyProfile::for_strategy(self.strategy)
    }

    pub fn delegation_allowed(&self) -> bool {
        self.profile().allow_delegation && !self.delegation_disabled
    }

    pub fn is_excluded(&self, path: &str, tool: &str) -> bool {
        self.exclusions.contains_key(&Exclusion {
            path: path.to_string(),
            tool: tool.to_string(),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    pub fn clarification(&self) -> Option<&str> {
        match &self.stop {
            Some(StopCause::Clarification { question }) => Some(question),
            _ => None,
        }
    }

    /// Appends a directive for the model as a user turn, merging into the
    /// trailing user turn so roles keep alternating.
    pub fn push_directive(&mut self, text: impl Into<String>) {
        let block = ContentBlock::text(text);
        match self.messages.last_mut() {
            Some(last) if last.role == Role::User => last.content.push(block),
            _ => self.messages.push(Message::tool_results(vec![block])),
        }
    }

    /// Structured summary of the session so far, injected before the
    /// transcript grows past the context threshold.
    pub fn memory_anchor(&self, request: &str, reads: &BTreeSet<String>) -> String {
        let mut lines = vec![
            "[memory anchor]".to_string(),
            format!("Request: {request}"),
            format!(
                "Iteration {} under {} strategy, {} tool calls so far.",
                self.iteration, self.strategy, self.tool_calls
            ),
        ];
        if reads.is_empty() {
            lines.push("Files read: none".to_string());
        } else {
            lines.push(format!(
                "Files read: {}",
                reads.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if self.changes.is_empty() {
            lines.push("Files edited: none".to_string());
        } else {
            lines.push(format!("Files edited: {}", self.changes.file_names().join(", ")));
        }
        if !self.exclusions.is_empty() {
            let disabled: Vec<String> = self
                .exclusions
                .keys()
                .map(|exclusion| format!("{} on {}", exclusion.tool, exclusion.path))
                .collect();
            lines.push(format!("Disabled tools: {}", disabled.join(", ")));
        }
        lines.join("\n")
    }
}
