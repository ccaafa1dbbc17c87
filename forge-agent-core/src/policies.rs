//! Corrective policies applied after every iteration.
//!
//! Each policy reads the iteration summary, updates its own counters in
//! [`LoopState`] and may return a directive for the model or stop the loop.
//! Every counter is bounded so the loop always terminates.

use forge_core::config::PolicyConfig;
use forge_protocol::Strategy;
use forge_protocol::tools;
use tracing::info;
use tracing::warn;

use crate::state::Exclusion;
use crate::state::FailedMutation;
use crate::state::IterationSummary;
use crate::state::LoopState;
use crate::state::StopCause;
use crate::strategy::Intent;

const SNIPPET_CONTEXT_LINES: usize = 5;

/// Result of running every policy for one iteration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub directives: Vec<String>,
    pub escalated_to: Option<Strategy>,
}

pub fn apply_policies(
    state: &mut LoopState,
    summary: &IterationSummary,
    config: &PolicyConfig,
) -> PolicyOutcome {
    let mut outcome = PolicyOutcome::default();
    let policies: [fn(&mut LoopState, &IterationSummary, &PolicyConfig) -> Option<String>; 4] =
        [mutation_failure, edit_sla, read_only_breaker, stagnation];
    for policy in policies {
        if state.is_stopped() {
            break;
        }
        if let Some(directive) = policy(state, summary, config) {
            outcome.directives.push(directive);
        }
    }
    if !state.is_stopped() {
        if let Some((strategy, directive)) = escalation(state, summary, config) {
            outcome.escalated_to = Some(strategy);
            outcome.directives.push(directive);
        }
    }
    outcome
}

/// Tracks consecutive failed mutations per file. Offers a snippet of the
/// target region at the first threshold and disables the failing tool for
/// that file at the second. A successful write clears both.
pub fn mutation_failure(
    state: &mut LoopState,
    summary: &IterationSummary,
    config: &PolicyConfig,
) -> Option<String> {
    for success in &summary.successful_mutations {
        state.mutation_failures.remove(&success.path);
        let before = state.exclusions.len();
        state.exclusions.retain(|exclusion, _| exclusion.path != success.path);
        if state.exclusions.len() != before {
            info!(path = %success.path, "exclusion lifted after successful alternative write");
        }
    }

    let mut directives = Vec::new();
    for failure in &summary.failed_mutations {
        let count = state.mutation_failures.entry(failure.path.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        if count == config.mutation_failure_snippet {
            directives.push(snippet_directive(failure));
        } else if count >= config.mutation_failure_disable {
            let exclusion = Exclusion {
                path: failure.path.clone(),
                tool: failure.tool.clone(),
            };
            if !state.exclusions.contains_key(&exclusion) {
                warn!(
                    path = %failure.path,
                    tool = %failure.tool,
                    "disabling tool for file after repeated failures"
                );
                state.exclusions.insert(exclusion, state.iteration);
                directives.push(format!(
                    "`{}` has failed {count} times on {}. It is disabled for that file. Use a different approach, for example `{}` with the complete new file content.",
                    failure.tool,
                    failure.path,
                    alternative_tool(&failure.tool)
                ));
            }
        }
    }
    if directives.is_empty() {
        None
    } else {
        Some(directives.join("\n\n"))
    }
}

fn alternative_tool(tool: &str) -> &'static str {
    if tool == tools::WRITE_FILE {
        tools::EDIT_FILE
    } else {
        tools::WRITE_FILE
    }
}

fn snippet_directive(failure: &FailedMutation) -> String {
    match failure
        .current_content
        .as_deref()
        .and_then(|content| extract_snippet(content, failure.old_text.as_deref()))
    {
        Some(snippet) => format!(
            "Edits to {} keep failing. This is the current text of the region you are targeting; copy `old_text` from it exactly:\n```\n{snippet}\n```",
            failure.path
        ),
        None => format!(
            "Edits to {} keep failing. Read the file again and copy `old_text` exactly from its current content.",
            failure.path
        ),
    }
}

/// Lines around the best match for the first non-blank line of
/// `old_text`, or the head of the file when nothing matches.
pub fn extract_snippet(content: &str, old_text: Option<&str>) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }
    let anchor = old_text
        .and_then(|text| text.lines().map(str::trim).find(|line| !line.is_empty()))
        .map(str::to_lowercase);
    let center = anchor
        .and_then(|anchor| {
            lines
                .iter()
                .position(|line| line.to_lowercase().contains(&anchor))
                .or_else(|| {
                    let first_word = anchor.split_whitespace().next()?.to_string();
                    lines.iter().position(|line| line.to_lowercase().contains(&first_word))
                })
        })
        .unwrap_or(0);
    let start = center.saturating_sub(SNIPPET_CONTEXT_LINES);
    let end = (center + SNIPPET_CONTEXT_LINES + 1).min(lines.len());
    Some(lines[start..end].join("\n"))
}

/// Forces a direct edit after too many tool calls without a mutation in
/// code mode; past the hard ceiling, stops and asks for clarification.
pub fn edit_sla(
    state: &mut LoopState,
    _summary: &IterationSummary,
    config: &PolicyConfig,
) -> Option<String> {
    if state.intent != Intent::Code || state.successful_mutations > 0 {
        return None;
    }
    if state.tool_calls >= config.edit_sla_hard {
        warn!(
            tool_calls = state.tool_calls,
            "no edit after hard ceiling, requesting clarification"
        );
        state.stop = Some(StopCause::Clarification {
            question: format!(
                "I inspected the project with {} tool calls but could not determine which change to make. Which file and what exact change do you want?",
                state.tool_calls
            ),
        });
        return None;
    }
    if state.tool_calls >= config.edit_sla_soft && !state.edit_sla_forced {
        state.edit_sla_forced = true;
        return Some(
            "You have used many tool calls without editing anything. Stop exploring and make the edit now with edit_file or write_file on the most relevant file."
                .to_string(),
        );
    }
    None
}

/// Forbids further reads after consecutive read-only iterations.
pub fn read_only_breaker(
    state: &mut LoopState,
    summary: &IterationSummary,
    config: &PolicyConfig,
) -> Option<String> {
    if summary.all_read_only() {
        state.consecutive_read_only += 1;
    } else if summary.tool_calls > 0 {
        state.consecutive_read_only = 0;
    }
    if state.intent != Intent::Code
        || state.consecutive_read_only < state.profile().read_only_threshold
        || state.read_only_nudges >= config.max_read_only_nudges
    {
        return None;
    }
    state.consecutive_read_only = 0;
    state.read_only_nudges += 1;
    Some(
        "You have enough context. Do not read or search any more files; apply the change now with a mutating tool."
            .to_string(),
    )
}

/// After the first edit, iterations that run tools without changing the
/// change set count as stagnation. Each threshold crossing injects a
/// rethink directive until the strategy's cap, then stops with a partial
/// result.
pub fn stagnation(
    state: &mut LoopState,
    summary: &IterationSummary,
    config: &PolicyConfig,
) -> Option<String> {
    if state.changes.is_empty() && !summary.net_new_change {
        return None;
    }
    if summary.net_new_change {
        state.iterations_since_change = 0;
        return None;
    }
    if summary.tool_calls == 0 {
        return None;
    }
    state.iterations_since_change += 1;
    if state.iterations_since_change < config.stagnation_iterations {
        return None;
    }
    state.iterations_since_change = 0;
    if state.rethinks >= state.profile().rethink_cap {
        info!(rethinks = state.rethinks, "stopping after repeated stagnation");
        state.stop = Some(StopCause::Stagnated);
        return None;
    }
    state.rethinks += 1;
    Some(format!(
        "The last {} iterations produced no new change. Rethink: check whether the request is already satisfied by your edits to {}. If it is, stop; otherwise take a different approach.",
        config.stagnation_iterations,
        state.changes.file_names().join(", ")
    ))
}

/// Upgrades the strategy when a non-trivial request stalls, and tells the
/// agent to edit directly instead of delegating.
pub fn escalation(
    state: &mut LoopState,
    summary: &IterationSummary,
    config: &PolicyConfig,
) -> Option<(Strategy, String)> {
    if summary.net_new_change {
        state.stalled_iterations = 0;
        return None;
    }
    state.stalled_iterations += 1;
    if state.tier.is_trivial() || state.stalled_iterations < config.escalation_stall_iterations {
        return None;
    }
    let next = state.strategy.escalate()?;
    info!(from = %state.strategy, to = %next, "escalating strategy");
    state.strategy = next;
    state.stalled_iterations = 0;
    state.escalations += 1;
    state.delegation_disabled = true;
    Some((
        next,
        format!(
            "Progress has stalled. Strategy upgraded to {next}. Delegation is disabled: make the edits yourself, directly."
        ),
    ))
}

/// Re-prompts a code-mode run that stops without any change. Returns the
/// nudge, or `None` when the stop should be accepted.
pub fn premature_stop(state: &mut LoopState, config: &PolicyConfig) -> Option<String> {
    if state.intent != Intent::Code
        || !state.changes.is_empty()
        || state.premature_nudges >= config.premature_stop_nudges
    {
        return None;
    }
    state.premature_nudges += 1;
    Some(
        "You stopped without making any change, but the request requires editing files. Continue and apply the edit with a tool call."
            .to_string(),
    )
}

/// Lifts exclusions older than the configured number of iterations.
pub fn expire_exclusions(state: &mut LoopState, config: &PolicyConfig) -> Vec<Exclusion> {
    let iteration = state.iteration;
    let expired: Vec<Exclusion> = state
        .exclusions
        .iter()
        .filter(|(_, since)| {
            iteration.saturating_sub(**since) >= config.exclusion_expiry_iterations
        })
        .map(|(exclusion, _)| exclusion.clone())
        .collect();
    for exclusion in &expired {
        state.exclusions.remove(exclusion);
        state.mutation_failures.remove(&exclusion.path);
        info!(path = %exclusion.path, tool = %exclusion.tool, "exclusion expired");
    }
    expired
}
