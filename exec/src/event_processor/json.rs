use forge_agent_core::ExecutionOutcome;
use forge_agent_core::LoopEvent;
use forge_core::Config;
use serde_json::Value;
use serde_json::json;

use super::EventProcessor;
use super::RunSummary;

/// Writes one JSON object per line to stdout.
pub(crate) struct EventProcessorWithJsonOutput;

impl EventProcessorWithJsonOutput {
    pub fn new() -> Self {
        Self
    }

    fn emit(value: &Value) {
        match serde_json::to_string(value) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("Failed to serialize event: {e:?}"),
        }
    }
}

impl EventProcessor for EventProcessorWithJsonOutput {
    fn print_config_summary(&mut self, config: &Config, summary: &RunSummary<'_>) {
        Self::emit(&json!({
            "type": "config",
            "execution_id": summary.execution_id,
            "project": summary.project.display().to_string(),
            "prompt": summary.prompt,
            "resumed": summary.resumed,
            "wall_clock_secs": config.execution.wall_clock.as_secs(),
            "fan_out": config.scheduler.fan_out,
        }));
    }

    fn process_event(&mut self, event: &LoopEvent) {
        Self::emit(&json!({"type": "event", "payload": event}));
    }

    fn process_outcome(&mut self, outcome: &ExecutionOutcome) {
        Self::emit(&json!({"type": "outcome", "payload": outcome}));
    }
}
