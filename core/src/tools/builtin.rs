//! Built-in file tools. They run against [`FileAccess`], so the same
//! executors serve the shared file store and sub-agent worktrees.

use std::sync::Arc;

use async_trait::async_trait;
use forge_protocol::ToolInput;
use forge_protocol::tools;
use regex_lite::Regex;

use super::ToolContext;
use super::ToolDispatcher;
use super::ToolExecutor;
use super::ToolOutput;
use crate::config::DispatcherConfig;
use crate::error::ForgeErr;
use crate::error::Result;
use crate::verification::SyntaxChecker;

pub const AUTO_LINT_PREFIX: &str = "Auto-lint:";

const MAX_GREP_LINES: usize = 200;
const MAX_LINT_DETAILS: usize = 5;

fn unexpected(tool: &str, input: &ToolInput) -> ToolOutput {
    ToolOutput::error(format!("{tool} cannot handle `{}` input", input.name()))
}

fn into_output(result: Result<ToolOutput>) -> ToolOutput {
    result.unwrap_or_else(|err| ToolOutput::error(err.to_string()))
}

/// Appends the syntax check of the new content to a mutation result.
fn with_auto_lint(mut output: ToolOutput, path: &str, content: &str) -> ToolOutput {
    let issues = if SyntaxChecker::applies_to(path) {
        SyntaxChecker::new().check(content)
    } else {
        Vec::new()
    };
    output
        .content
        .push_str(&format!("\n{AUTO_LINT_PREFIX} {} issues", issues.len()));
    for issue in issues.iter().take(MAX_LINT_DETAILS) {
        output
            .content
            .push_str(&format!("\n  {path}:{}: {}", issue.line, issue.message));
    }
    output.lint_issues = Some(issues.len());
    output
}

/// Compiles `pattern` as a regex, falling back to a literal match.
fn matcher(pattern: &str) -> Box<dyn Fn(&str) -> bool + Send + Sync> {
    match Regex::new(pattern) {
        Ok(regex) => Box::new(move |text: &str| regex.is_match(text)),
        Err(_) => {
            let needle = pattern.to_string();
            Box::new(move |text: &str| text.contains(needle.as_str()))
        }
    }
}

struct ReadFileTool;

#[async_trait]
impl ToolExecutor for ReadFileTool {
    fn name(&self) -> &'static str {
        tools::READ_FILE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::ReadFile { path } = input else {
            return unexpected(self.name(), input);
        };
        match ctx.files.read(path).await {
            Ok(Some(content)) => ToolOutput::success(content),
            Ok(None) => ToolOutput::error(ForgeErr::FileNotFound(path.clone()).to_string()),
            Err(err) => ToolOutput::error(err.to_string()),
        }
    }
}

struct EditFileTool;

impl EditFileTool {
    async fn edit(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        let Some(current) = ctx.files.peek(path).await? else {
            return Err(ForgeErr::FileNotFound(path.to_string()));
        };
        let matches = current.matches(old_text).count();
        match matches {
            0 => Ok(ToolOutput::error(format!(
                "old_text was not found in {path}; read the file again and copy the exact text"
            ))),
            1 => {
                let updated = current.replacen(old_text, new_text, 1);
                ctx.files.write(path, &updated).await?;
                let output = ToolOutput::success(format!("Edited {path}")).with_touched(path);
                Ok(with_auto_lint(output, path, &updated))
            }
            n => Ok(ToolOutput::error(format!(
                "old_text matches {n} places in {path}; include more surrounding lines so it is unique"
            ))),
        }
    }
}

#[async_trait]
impl ToolExecutor for EditFileTool {
    fn name(&self) -> &'static str {
        tools::EDIT_FILE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::EditFile {
            path,
            old_text,
            new_text,
        } = input
        else {
            return unexpected(self.name(), input);
        };
        into_output(self.edit(path, old_text, new_text, ctx).await)
    }
}

struct WriteFileTool;

#[async_trait]
impl ToolExecutor for WriteFileTool {
    fn name(&self) -> &'static str {
        tools::WRITE_FILE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::WriteFile { path, content } = input else {
            return unexpected(self.name(), input);
        };
        into_output(ctx.files.write(path, content).await.map(|()| {
            let output = ToolOutput::success(format!("Wrote {path} ({} bytes)", content.len()))
                .with_touched(path);
            with_auto_lint(output, path, content)
        }))
    }
}

struct CreateFileTool;

#[async_trait]
impl ToolExecutor for CreateFileTool {
    fn name(&self) -> &'static str {
        tools::CREATE_FILE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::CreateFile { path, content } = input else {
            return unexpected(self.name(), input);
        };
        into_output(ctx.files.create(path, content).await.map(|()| {
            let output = ToolOutput::success(format!("Created {path}")).with_touched(path);
            with_auto_lint(output, path, content)
        }))
    }
}

struct DeleteFileTool;

#[async_trait]
impl ToolExecutor for DeleteFileTool {
    fn name(&self) -> &'static str {
        tools::DELETE_FILE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::DeleteFile { path } = input else {
            return unexpected(self.name(), input);
        };
        into_output(
            ctx.files
                .delete(path)
                .await
                .map(|()| ToolOutput::success(format!("Deleted {path}")).with_touched(path)),
        )
    }
}

struct ListFilesTool;

#[async_trait]
impl ToolExecutor for ListFilesTool {
    fn name(&self) -> &'static str {
        tools::LIST_FILES
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::ListFiles { prefix } = input else {
            return unexpected(self.name(), input);
        };
        match ctx.files.list(prefix.as_deref()).await {
            Ok(paths) if paths.is_empty() => ToolOutput::success("no files"),
            Ok(paths) => ToolOutput::success(paths.join("\n")),
            Err(err) => ToolOutput::error(err.to_string()),
        }
    }
}

/// Matches file paths (not content) against a pattern.
struct SearchFilesTool;

#[async_trait]
impl ToolExecutor for SearchFilesTool {
    fn name(&self) -> &'static str {
        tools::SEARCH_FILES
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::SearchFiles { pattern } = input else {
            return unexpected(self.name(), input);
        };
        let is_match = matcher(pattern);
        match ctx.files.list(None).await {
            Ok(paths) => {
                let found: Vec<String> = paths.into_iter().filter(|path| is_match(path)).collect();
                if found.is_empty() {
                    ToolOutput::success(format!("no files match '{pattern}'"))
                } else {
                    ToolOutput::success(found.join("\n"))
                }
            }
            Err(err) => ToolOutput::error(err.to_string()),
        }
    }
}

struct GrepTool;

impl GrepTool {
    async fn grep(
        &self,
        pattern: &str,
        path: Option<&str>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        let is_match = matcher(pattern);
        let paths = match path {
            Some(path) => vec![path.to_string()],
            None => ctx.files.list(None).await?,
        };
        let mut lines = Vec::new();
        let mut total = 0usize;
        for path in paths {
            // Pattern search does not count as reading the file.
            let Some(content) = ctx.files.peek(&path).await? else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                if !is_match(line) {
                    continue;
                }
                total += 1;
                if lines.len() < MAX_GREP_LINES {
                    lines.push(format!("{path}:{}: {}", index + 1, line.trim()));
                }
            }
        }
        if total == 0 {
            return Ok(ToolOutput::success(format!("no matches for '{pattern}'")));
        }
        let mut content = lines.join("\n");
        if total > lines.len() {
            content.push_str(&format!("\n... ({} more matches)", total - lines.len()));
        }
        Ok(ToolOutput::success(content))
    }
}

#[async_trait]
impl ToolExecutor for GrepTool {
    fn name(&self) -> &'static str {
        tools::GREP
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::Grep { pattern, path } = input else {
            return unexpected(self.name(), input);
        };
        into_output(self.grep(pattern, path.as_deref(), ctx).await)
    }
}

struct ReadReferenceTool;

#[async_trait]
impl ToolExecutor for ReadReferenceTool {
    fn name(&self) -> &'static str {
        tools::READ_REFERENCE
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> ToolOutput {
        let ToolInput::ReadReference { reference_id } = input else {
            return unexpected(self.name(), input);
        };
        match ctx.lookaside.get(reference_id) {
            Some(entry) => ToolOutput::success(entry.content),
            None => ToolOutput::error(format!("unknown reference id `{reference_id}`")),
        }
    }
}

pub fn register_builtin_tools(dispatcher: &mut ToolDispatcher) {
    dispatcher.register(Arc::new(ReadFileTool));
    dispatcher.register(Arc::new(EditFileTool));
    dispatcher.register(Arc::new(WriteFileTool));
    dispatcher.register(Arc::new(CreateFileTool));
    dispatcher.register(Arc::new(DeleteFileTool));
    dispatcher.register(Arc::new(ListFilesTool));
    dispatcher.register(Arc::new(SearchFilesTool));
    dispatcher.register(Arc::new(GrepTool));
    dispatcher.register(Arc::new(ReadReferenceTool));
}

/// Dispatcher with every file tool registered. Delegation is registered by
/// the agent loop.
pub fn builtin_dispatcher(config: DispatcherConfig) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new(config);
    register_builtin_tools(&mut dispatcher);
    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::Lookaside;
    use crate::config::FileStoreConfig;
    use crate::file_store::FileRef;
    use crate::file_store::FileStore;
    use crate::file_store::InMemoryFileBackend;
    use crate::tools::DispatchStatus;
    use forge_protocol::ToolCall;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use serde_json::json;

    const HEADER: &str = "<h1 style=\"color: red\">{{ shop.name }}</h1>\n<p>red</p>\n";

    fn setup() -> (Arc<FileStore>, ToolContext, ToolDispatcher) {
        let store = Arc::new(FileStore::new(
            "p1",
            Arc::new(InMemoryFileBackend::new()),
            FileStoreConfig::default(),
        ));
        store.preload([
            (FileRef::from_path("sections/header.liquid"), Some(HEADER.to_string())),
            (
                FileRef::from_path("sections/footer.liquid"),
                Some("<footer>{{ 'footer' | t }}</footer>\n".to_string()),
            ),
        ]);
        let ctx = ToolContext::new("main", store.clone(), Arc::new(Lookaside::new()));
        (store, ctx, builtin_dispatcher(DispatcherConfig::default()))
    }

    async fn run(
        dispatcher: &ToolDispatcher,
        ctx: &ToolContext,
        name: &str,
        input: Value,
    ) -> ToolOutput {
        let result = dispatcher.dispatch(&ToolCall::new("c1", name, input), ctx).await;
        assert_eq!(result.status, DispatchStatus::Completed);
        result.output
    }

    #[tokio::test]
    async fn test_read_marks_file_as_read() {
        let (store, ctx, dispatcher) = setup();
        let output = run(
            &dispatcher,
            &ctx,
            "read_file",
            json!({"path": "sections/header.liquid"}),
        )
        .await;
        assert_eq!(output.content, HEADER);
        assert!(store.was_read("sections/header.liquid"));

        let missing = run(&dispatcher, &ctx, "read_file", json!({"path": "nope.liquid"})).await;
        assert!(missing.is_error);
    }

    #[tokio::test]
    async fn test_edit_requires_a_unique_match() {
        let (store, ctx, dispatcher) = setup();
        let output = run(
            &dispatcher,
            &ctx,
            "edit_file",
            json!({
                "path": "sections/header.liquid",
                "old_text": "color: red",
                "new_text": "color: blue"
            }),
        )
        .await;
        assert!(!output.is_error, "{}", output.content);
        assert_eq!(output.touched, vec!["sections/header.liquid".to_string()]);
        assert_eq!(output.lint_issues, Some(0));
        assert!(output.content.contains("Auto-lint: 0 issues"));
        assert!(store.is_dirty("sections/header.liquid"));
        assert!(!store.was_read("sections/header.liquid"));

        let ambiguous = run(
            &dispatcher,
            &ctx,
            "edit_file",
            json!({"path": "sections/header.liquid", "old_text": "h1", "new_text": "h2"}),
        )
        .await;
        assert!(ambiguous.is_error);
        assert!(ambiguous.content.contains("matches 2 places"));

        let missing = run(
            &dispatcher,
            &ctx,
            "edit_file",
            json!({"path": "sections/header.liquid", "old_text": "green", "new_text": "x"}),
        )
        .await;
        assert!(missing.is_error);
    }

    #[tokio::test]
    async fn test_write_reports_lint_issues() {
        let (_store, ctx, dispatcher) = setup();
        let output = run(
            &dispatcher,
            &ctx,
            "write_file",
            json!({"path": "sections/header.liquid", "content": "{% if x %}\n{{ broken"}),
        )
        .await;
        assert!(!output.is_error);
        assert_eq!(output.lint_issues, Some(2));
        assert!(output.content.contains("Auto-lint: 2 issues"));
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let (store, ctx, dispatcher) = setup();
        let created = run(
            &dispatcher,
            &ctx,
            "create_file",
            json!({"path": "snippets/badge.liquid", "content": "<span></span>"}),
        )
        .await;
        assert!(!created.is_error);
        let again = run(
            &dispatcher,
            &ctx,
            "create_file",
            json!({"path": "snippets/badge.liquid", "content": "x"}),
        )
        .await;
        assert!(again.is_error);

        let deleted = run(
            &dispatcher,
            &ctx,
            "delete_file",
            json!({"path": "sections/footer.liquid"}),
        )
        .await;
        assert!(!deleted.is_error);
        assert_eq!(
            store.list(None),
            vec!["sections/header.liquid".to_string(), "snippets/badge.liquid".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_and_search_files() {
        let (_store, ctx, dispatcher) = setup();
        let listed = run(&dispatcher, &ctx, "list_files", json!({"prefix": "sections/"})).await;
        assert_eq!(listed.content, "sections/footer.liquid\nsections/header.liquid");

        let found = run(&dispatcher, &ctx, "search_files", json!({"pattern": "head(er)?"})).await;
        assert_eq!(found.content, "sections/header.liquid");

        let literal = run(&dispatcher, &ctx, "search_files", json!({"pattern": "foot("})).await;
        assert_eq!(literal.content, "no files match 'foot('");
    }

    #[tokio::test]
    async fn test_grep_does_not_count_as_read() {
        let (store, ctx, dispatcher) = setup();
        let output = run(&dispatcher, &ctx, "grep", json!({"pattern": "red"})).await;
        assert_eq!(
            output.content,
            concat!(
                "sections/header.liquid:1: <h1 style=\"color: red\">{{ shop.name }}</h1>\n",
                "sections/header.liquid:2: <p>red</p>"
            )
        );
        assert!(!store.was_read("sections/header.liquid"));
    }

    #[tokio::test]
    async fn test_read_reference() {
        let (_store, ctx, dispatcher) = setup();
        let id = ctx.lookaside.store("read_file", None, "full text".to_string());
        let output = run(&dispatcher, &ctx, "read_reference", json!({"reference_id": id})).await;
        assert_eq!(output.content, "full text");
        let unknown = run(
            &dispatcher,
            &ctx,
            "read_reference",
            json!({"reference_id": "ref-99"}),
        )
        .await;
        assert!(unknown.is_error);
    }
}
