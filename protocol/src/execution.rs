//! Execution records, proposed changes and validation findings.

use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::models::Message;

/// Lifecycle status of one agent run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Phases of the control loop state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    ResolveIntent,
    BuildPatch,
    ApplyPatch,
    Verify,
    Complete,
}

/// Operating mode of the loop. Controls tool budget, iteration ceiling and
/// delegation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Simple,
    Hybrid,
    GodMode,
}

impl Strategy {
    /// Next, more aggressive strategy. `None` once already at the top.
    pub fn escalate(self) -> Option<Strategy> {
        match self {
            Strategy::Simple => Some(Strategy::Hybrid),
            Strategy::Hybrid => Some(Strategy::GodMode),
            Strategy::GodMode => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Strategy::Simple => "SIMPLE",
            Strategy::Hybrid => "HYBRID",
            Strategy::GodMode => "GOD_MODE",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Modify,
    Create,
    Delete,
}

/// A proposed mutation of one project file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub file_id: String,
    pub file_name: String,
    pub original_content: String,
    pub proposed_content: String,
    pub rationale: String,
    pub agent: String,
    pub kind: ChangeKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAgentRecord {
    pub name: String,
    pub status: SubAgentStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    pub notes: String,
}

/// One end-to-end agent run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub request: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub sub_agents: Vec<SubAgentRecord>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub changes_by_agent: BTreeMap<String, Vec<Change>>,
    #[serde(default)]
    pub review: Option<ReviewResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            request: request.into(),
            status: ExecutionStatus::Pending,
            sub_agents: Vec::new(),
            messages: Vec::new(),
            changes_by_agent: BTreeMap::new(),
            review: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn change_count(&self) -> usize {
        self.changes_by_agent.values().map(Vec::len).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Syntax,
    ThemeCheck,
    CrossFile,
    OutOfContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A finding reported by the verification gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub category: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            file: None,
            line: None,
            category: None,
            message: message.into(),
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strategy_escalation_chain() {
        assert_eq!(Strategy::Simple.escalate(), Some(Strategy::Hybrid));
        assert_eq!(Strategy::Hybrid.escalate(), Some(Strategy::GodMode));
        assert_eq!(Strategy::GodMode.escalate(), None);
    }

    #[test]
    fn test_strategy_wire_names() {
        assert_eq!(serde_json::to_string(&Strategy::GodMode).unwrap(), "\"GOD_MODE\"");
        assert_eq!(Strategy::GodMode.to_string(), "GOD_MODE");
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::InProgress.is_terminal());
    }
}
