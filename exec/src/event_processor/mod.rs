mod human;
mod json;

use std::path::Path;
use std::process::ExitCode;

use forge_agent_core::ExecutionOutcome;
use forge_agent_core::LoopEvent;
use forge_core::Config;
use forge_protocol::ExecutionStatus;

pub(crate) use human::EventProcessorWithHumanOutput;
pub(crate) use json::EventProcessorWithJsonOutput;

/// What the CLI prints before the run starts.
pub(crate) struct RunSummary<'a> {
    pub execution_id: Option<&'a str>,
    pub project: &'a Path,
    pub prompt: &'a str,
    pub resumed: bool,
}

pub(crate) trait EventProcessor {
    /// Print summary of effective configuration and user prompt.
    fn print_config_summary(&mut self, config: &Config, summary: &RunSummary<'_>);

    /// Handle a single event emitted by the execution driver.
    fn process_event(&mut self, event: &LoopEvent);

    /// Print the final outcome of the hop.
    fn process_outcome(&mut self, outcome: &ExecutionOutcome);
}

/// Exit code for an outcome. A checkpointed hop has not failed.
pub(crate) fn exit_code(outcome: &ExecutionOutcome) -> ExitCode {
    match outcome.status {
        Some(ExecutionStatus::Failed) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

pub(crate) fn handle_last_message(
    last_agent_message: Option<&str>,
    last_message_path: Option<&Path>,
) {
    let Some(path) = last_message_path else {
        return;
    };
    let contents = last_agent_message.unwrap_or("");
    if let Err(e) = std::fs::write(path, contents) {
        eprintln!("Failed to write last message file {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_last_message_is_written_when_path_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last.txt");
        handle_last_message(Some("Done."), Some(&path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Done.");

        handle_last_message(None, Some(&path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
