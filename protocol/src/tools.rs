//! Tool calls emitted by the model and the tagged input union the runtime
//! dispatches on.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

pub const READ_FILE: &str = "read_file";
pub const EDIT_FILE: &str = "edit_file";
pub const WRITE_FILE: &str = "write_file";
pub const CREATE_FILE: &str = "create_file";
pub const DELETE_FILE: &str = "delete_file";
pub const LIST_FILES: &str = "list_files";
pub const SEARCH_FILES: &str = "search_files";
pub const GREP: &str = "grep";
pub const READ_REFERENCE: &str = "read_reference";
pub const DELEGATE: &str = "delegate";
pub const ASK_CLARIFICATION: &str = "ask_clarification";

const KNOWN_TOOLS: &[&str] = &[
    READ_FILE,
    EDIT_FILE,
    WRITE_FILE,
    CREATE_FILE,
    DELETE_FILE,
    LIST_FILES,
    SEARCH_FILES,
    GREP,
    READ_REFERENCE,
    DELEGATE,
    ASK_CLARIFICATION,
];

/// A raw tool invocation as produced by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn parse(&self) -> Result<ToolInput, ToolInputError> {
        ToolInput::parse(&self.name, &self.input)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolInputError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid input for `{tool}`: {message}")]
    InvalidInput { tool: String, message: String },
}

/// Validated tool input, one variant per tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum ToolInput {
    ReadFile {
        path: String,
    },
    EditFile {
        path: String,
        old_text: String,
        new_text: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    CreateFile {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
    ListFiles {
        #[serde(default)]
        prefix: Option<String>,
    },
    SearchFiles {
        pattern: String,
    },
    Grep {
        pattern: String,
        #[serde(default)]
        path: Option<String>,
    },
    ReadReference {
        reference_id: String,
    },
    Delegate {
        task: String,
        #[serde(default)]
        files: Vec<String>,
    },
    AskClarification {
        question: String,
    },
}

impl ToolInput {
    /// Validates the model's `(name, input)` pair into a typed variant.
    pub fn parse(name: &str, input: &Value) -> Result<Self, ToolInputError> {
        if !KNOWN_TOOLS.contains(&name) {
            return Err(ToolInputError::UnknownTool(name.to_string()));
        }
        let input = if input.is_null() { json!({}) } else { input.clone() };
        let parsed: ToolInput = serde_json::from_value(json!({ "tool": name, "input": input }))
            .map_err(|err| ToolInputError::InvalidInput {
                tool: name.to_string(),
                message: err.to_string(),
            })?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ToolInputError> {
        let invalid = |message: &str| ToolInputError::InvalidInput {
            tool: self.name().to_string(),
            message: message.to_string(),
        };
        match self {
            ToolInput::ReadFile { path }
            | ToolInput::WriteFile { path, .. }
            | ToolInput::CreateFile { path, .. }
            | ToolInput::DeleteFile { path }
                if normalize_path(path).is_empty() =>
            {
                Err(invalid("path must not be empty"))
            }
            ToolInput::EditFile { path, old_text, .. } => {
                if normalize_path(path).is_empty() {
                    Err(invalid("path must not be empty"))
                } else if old_text.is_empty() {
                    Err(invalid("old_text must not be empty"))
                } else {
                    Ok(())
                }
            }
            ToolInput::SearchFiles { pattern } | ToolInput::Grep { pattern, .. }
                if pattern.is_empty() =>
            {
                Err(invalid("pattern must not be empty"))
            }
            ToolInput::Delegate { task, .. } if task.trim().is_empty() => {
                Err(invalid("task must not be empty"))
            }
            ToolInput::AskClarification { question } if question.trim().is_empty() => {
                Err(invalid("question must not be empty"))
            }
            _ => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolInput::ReadFile { .. } => READ_FILE,
            ToolInput::EditFile { .. } => EDIT_FILE,
            ToolInput::WriteFile { .. } => WRITE_FILE,
            ToolInput::CreateFile { .. } => CREATE_FILE,
            ToolInput::DeleteFile { .. } => DELETE_FILE,
            ToolInput::ListFiles { .. } => LIST_FILES,
            ToolInput::SearchFiles { .. } => SEARCH_FILES,
            ToolInput::Grep { .. } => GREP,
            ToolInput::ReadReference { .. } => READ_REFERENCE,
            ToolInput::Delegate { .. } => DELEGATE,
            ToolInput::AskClarification { .. } => ASK_CLARIFICATION,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ToolInput::EditFile { .. }
                | ToolInput::WriteFile { .. }
                | ToolInput::CreateFile { .. }
                | ToolInput::DeleteFile { .. }
        )
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ToolInput::ReadFile { .. }
                | ToolInput::ListFiles { .. }
                | ToolInput::SearchFiles { .. }
                | ToolInput::Grep { .. }
                | ToolInput::ReadReference { .. }
        )
    }

    /// Calls matched by pattern rather than by file. The scheduler never
    /// runs them in parallel, even when a path narrows the search.
    pub fn is_pattern_based(&self) -> bool {
        matches!(self, ToolInput::SearchFiles { .. } | ToolInput::Grep { .. })
    }

    /// Delegation runs a nested model loop and gets the longer timeout.
    pub fn is_orchestration(&self) -> bool {
        matches!(self, ToolInput::Delegate { .. })
    }

    /// Project paths this call targets. Pattern based calls (`search_files`,
    /// `grep` without a path, `list_files`) derive none.
    pub fn target_paths(&self) -> Vec<String> {
        match self {
            ToolInput::ReadFile { path }
            | ToolInput::EditFile { path, .. }
            | ToolInput::WriteFile { path, .. }
            | ToolInput::CreateFile { path, .. }
            | ToolInput::DeleteFile { path } => vec![normalize_path(path)],
            ToolInput::Grep { path: Some(path), .. } => vec![normalize_path(path)],
            ToolInput::Delegate { files, .. } => {
                let mut paths: Vec<String> = files.iter().map(|f| normalize_path(f)).collect();
                paths.sort();
                paths.dedup();
                paths.retain(|p| !p.is_empty());
                paths
            }
            _ => Vec::new(),
        }
    }
}

/// Canonical project-relative form of a path: forward slashes, no leading
/// `./` or `/`, no empty segments.
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Tool schema advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Definitions for every built-in tool. `include_delegate` is false for
/// sub-agents and when delegation has been disabled.
pub fn builtin_tool_definitions(include_delegate: bool) -> Vec<ToolDefinition> {
    let path = json!({"type": "string"});
    let mut defs = vec![
        ToolDefinition::new(
            READ_FILE,
            "Read a project file.",
            object_schema(json!({"path": path}), &["path"]),
        ),
        ToolDefinition::new(
            EDIT_FILE,
            "Replace an exact snippet of a file with new text.",
            object_schema(
                json!({
                    "path": path,
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"}
                }),
                &["path", "old_text", "new_text"],
            ),
        ),
        ToolDefinition::new(
            WRITE_FILE,
            "Overwrite a file with new content.",
            object_schema(
                json!({"path": path, "content": {"type": "string"}}),
                &["path", "content"],
            ),
        ),
        ToolDefinition::new(
            CREATE_FILE,
            "Create a new file.",
            object_schema(
                json!({"path": path, "content": {"type": "string"}}),
                &["path", "content"],
            ),
        ),
        ToolDefinition::new(
            DELETE_FILE,
            "Delete a file.",
            object_schema(json!({"path": path}), &["path"]),
        ),
        ToolDefinition::new(
            LIST_FILES,
            "List project files, optionally under a prefix.",
            object_schema(json!({"prefix": {"type": "string"}}), &[]),
        ),
        ToolDefinition::new(
            SEARCH_FILES,
            "Find files whose path matches a pattern.",
            object_schema(json!({"pattern": {"type": "string"}}), &["pattern"]),
        ),
        ToolDefinition::new(
            GREP,
            "Search file contents for a regular expression.",
            object_schema(json!({"pattern": {"type": "string"}, "path": path}), &["pattern"]),
        ),
        ToolDefinition::new(
            READ_REFERENCE,
            "Retrieve the full content of a compacted tool result.",
            object_schema(json!({"reference_id": {"type": "string"}}), &["reference_id"]),
        ),
        ToolDefinition::new(
            ASK_CLARIFICATION,
            "Stop and ask the user a question.",
            object_schema(json!({"question": {"type": "string"}}), &["question"]),
        ),
    ];
    if include_delegate {
        defs.push(ToolDefinition::new(
            DELEGATE,
            "Hand a narrow sub-task to a specialist agent working on the listed files.",
            object_schema(
                json!({"task": {"type": "string"}, "files": {"type": "array", "items": path}}),
                &["task", "files"],
            ),
        ));
    }
    defs
}
