use forge_agent_core::ExecutionOutcome;
use forge_agent_core::LoopEvent;
use forge_core::Config;
use forge_protocol::ChangeKind;
use forge_protocol::execution::Severity;

use super::EventProcessor;
use super::RunSummary;

/// Plain-text progress on stdout.
pub(crate) struct EventProcessorWithHumanOutput {
    tool_calls: usize,
}

impl EventProcessorWithHumanOutput {
    pub fn new() -> Self {
        Self { tool_calls: 0 }
    }
}

fn change_marker(kind: ChangeKind) -> char {
    match kind {
        ChangeKind::Create => 'A',
        ChangeKind::Modify => 'M',
        ChangeKind::Delete => 'D',
    }
}

impl EventProcessor for EventProcessorWithHumanOutput {
    fn print_config_summary(&mut self, config: &Config, summary: &RunSummary<'_>) {
        println!("forge-exec");
        println!("--------");
        println!("project: {}", summary.project.display());
        if let Some(id) = summary.execution_id {
            println!("execution: {id}");
        }
        println!(
            "budget: {}s per hop, fan-out {}",
            config.execution.wall_clock.as_secs(),
            config.scheduler.fan_out
        );
        println!("--------");
        let label = if summary.resumed { "resuming" } else { "user" };
        println!("{label}\n{}", summary.prompt);
    }

    fn process_event(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::IterationStarted { iteration, .. } => {
                println!("\niteration {iteration}");
            }
            LoopEvent::ToolFinished {
                tool,
                is_error,
                elapsed_ms,
                ..
            } => {
                self.tool_calls += 1;
                let result = if *is_error { "failed" } else { "ok" };
                println!("  {tool} {result} in {elapsed_ms}ms");
            }
            LoopEvent::StrategyEscalated { from, to, .. } => {
                println!("  strategy escalated: {from} -> {to}");
            }
            LoopEvent::ConflictDetected { path, .. } => {
                println!("  conflict on {path}");
            }
            LoopEvent::CompactedReread { path, .. } => {
                println!("  re-read compacted {path}");
            }
            LoopEvent::PersistFailure { file_ids, .. } => {
                eprintln!("  could not persist: {}", file_ids.join(", "));
            }
            LoopEvent::CheckpointSaved {
                iteration, dirty_files, ..
            } => {
                println!("  checkpoint saved at iteration {iteration} ({dirty_files} dirty)");
            }
            LoopEvent::ExecutionFinished { .. } => {}
        }
    }

    fn process_outcome(&mut self, outcome: &ExecutionOutcome) {
        println!();
        match outcome.status {
            Some(status) => println!("{status} after {} iteration(s)", outcome.iterations),
            None => println!("checkpointed after {} iteration(s)", outcome.iterations),
        }
        for change in &outcome.changes {
            println!("  {} {}", change_marker(change.kind), change.file_name);
        }
        for issue in &outcome.validation_issues {
            let severity = match issue.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
                Severity::Info => "info",
            };
            match &issue.file {
                Some(file) => println!("  {severity}: {file}: {}", issue.message),
                None => println!("  {severity}: {}", issue.message),
            }
        }
        if !outcome.persist_failures.is_empty() {
            eprintln!("not persisted: {}", outcome.persist_failures.join(", "));
        }
        println!(
            "tokens used: {} ({} tool calls)",
            outcome.usage.total(),
            self.tool_calls
        );
        if !outcome.response.is_empty() {
            println!("\n{}", outcome.response);
        }
        if outcome.checkpointed {
            println!("\nContinue with: forge-exec resume {}", outcome.execution_id);
        }
    }
}
