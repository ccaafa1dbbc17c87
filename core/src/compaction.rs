//! Microcompaction of the conversation transcript.
//!
//! The most recent `hot_tail` tool-result turns stay verbatim. Older tool
//! results above the size threshold are replaced by a short tool-aware
//! summary and the original text moves into the [`Lookaside`], from which a
//! `read_reference` call returns it unchanged.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use forge_protocol::ContentBlock;
use forge_protocol::Message;
use forge_protocol::tools;
use forge_protocol::tools::normalize_path;
use regex_lite::Regex;
use serde_json::Value;
use tracing::debug;

use crate::config::CompactionConfig;

/// Prefix of every compacted tool result.
pub const COMPACTED_MARKER: &str = "[compacted ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookasideEntry {
    pub tool: String,
    pub path: Option<String>,
    pub content: String,
}

/// Original content of compacted tool results, keyed by reference id.
#[derive(Debug, Default)]
pub struct Lookaside {
    entries: Mutex<HashMap<String, LookasideEntry>>,
    next_id: AtomicU64,
}

impl Lookaside {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `content` and returns its generated reference id.
    pub fn store(&self, tool: &str, path: Option<String>, content: String) -> String {
        let id = format!("ref-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = LookasideEntry {
            tool: tool.to_string(),
            path,
            content,
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), entry);
        id
    }

    pub fn get(&self, reference_id: &str) -> Option<LookasideEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub compacted: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub references: Vec<String>,
}

impl CompactionReport {
    pub fn bytes_saved(&self) -> usize {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

pub struct MicroCompactor {
    config: CompactionConfig,
    lookaside: Arc<Lookaside>,
    compacted_paths: HashSet<String>,
    rereads: u64,
}

#[allow(clippy::expect_used)]
fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:\{%-?\s*(?:assign|capture)\s+|\b(?:fn|function|class|def)\s+)([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("valid declaration regex")
    })
}

#[allow(clippy::expect_used)]
fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{%-?\s*(?:render|include|section)\s+['"]([^'"]+)['"]"#)
            .expect("valid reference regex")
    })
}

fn preview_list(items: &[String], limit: usize) -> String {
    let mut shown: Vec<&str> = items.iter().take(limit).map(String::as_str).collect();
    if items.len() > limit {
        shown.push("...");
    }
    shown.join(", ")
}

fn unique_captures(regex: &Regex, content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    regex
        .captures_iter(content)
        .filter_map(|captures| captures.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn summarize_read(path: &str, content: &str) -> String {
    let mut summary = format!("read_file {path}: {} lines", content.lines().count());
    let declared = unique_captures(declaration_regex(), content);
    if !declared.is_empty() {
        summary.push_str(&format!("; declares {}", preview_list(&declared, 8)));
    }
    let referenced = unique_captures(reference_regex(), content);
    if !referenced.is_empty() {
        summary.push_str(&format!("; references {}", preview_list(&referenced, 8)));
    }
    summary
}

/// Groups `path:line: text` match lines by path.
fn summarize_matches(label: &str, content: &str) -> String {
    let mut by_file: BTreeMap<&str, usize> = BTreeMap::new();
    let mut total = 0;
    for line in content.lines() {
        let Some((path, rest)) = line.split_once(':') else {
            continue;
        };
        if rest.split_once(':').is_some_and(|(n, _)| n.trim().parse::<usize>().is_ok()) {
            *by_file.entry(path).or_default() += 1;
            total += 1;
        }
    }
    if total == 0 {
        return format!("{label}: {} lines of output", content.lines().count());
    }
    let mut grouped: Vec<(&str, usize)> = by_file.into_iter().collect();
    grouped.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let files: Vec<String> = grouped
        .iter()
        .map(|(path, count)| format!("{path} ({count})"))
        .collect();
    format!(
        "{label}: {total} matches in {} files: {}",
        grouped.len(),
        preview_list(&files, 6)
    )
}

fn summarize(tool: &str, input: Option<&Value>, content: &str) -> String {
    let field = |name: &str| {
        input
            .and_then(|value| value.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match tool {
        tools::READ_FILE => summarize_read(&normalize_path(&field("path")), content),
        tools::GREP | tools::SEARCH_FILES => {
            summarize_matches(&format!("{tool} '{}'", field("pattern")), content)
        }
        tools::LIST_FILES => format!("list_files: {} paths", content.lines().count()),
        _ => {
            let first = content.lines().next().unwrap_or_default();
            let first: String = first.chars().take(80).collect();
            format!(
                "{tool}: {} lines, {} bytes; starts with: {first}",
                content.lines().count(),
                content.len()
            )
        }
    }
}

impl MicroCompactor {
    pub fn new(config: CompactionConfig, lookaside: Arc<Lookaside>) -> Self {
        Self {
            config,
            lookaside,
            compacted_paths: HashSet::new(),
            rereads: 0,
        }
    }

    pub fn lookaside(&self) -> &Arc<Lookaside> {
        &self.lookaside
    }

    /// Demotes large tool results outside the hot tail. Error results and
    /// already compacted results are left alone.
    pub fn compact(&mut self, messages: &mut [Message]) -> CompactionReport {
        let mut report = CompactionReport::default();
        let turns: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, message)| message.has_tool_results())
            .map(|(index, _)| index)
            .collect();
        let cold = turns.len().saturating_sub(self.config.hot_tail);
        if cold == 0 {
            return report;
        }

        let calls: HashMap<String, (String, Value)> = messages
            .iter()
            .flat_map(|message| message.tool_uses())
            .map(|(id, name, input)| (id.to_string(), (name.to_string(), input.clone())))
            .collect();

        for &index in &turns[..cold] {
            for block in &mut messages[index].content {
                let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = block
                else {
                    continue;
                };
                if *is_error
                    || content.len() <= self.config.size_threshold
                    || content.starts_with(COMPACTED_MARKER)
                {
                    continue;
                }
                let (tool, input) = match calls.get(tool_use_id.as_str()) {
                    Some((tool, input)) => (tool.as_str(), Some(input)),
                    None => ("tool", None),
                };
                let path = input
                    .and_then(|value| value.get("path"))
                    .and_then(Value::as_str)
                    .map(normalize_path);
                let summary = summarize(tool, input, content);
                let original = std::mem::take(content);
                report.bytes_before += original.len();
                let reference_id = self.lookaside.store(tool, path.clone(), original);
                *content = format!(
                    "{COMPACTED_MARKER}{reference_id}] {summary}. Call read_reference with reference_id \"{reference_id}\" for the full output."
                );
                report.bytes_after += content.len();
                if tool == tools::READ_FILE {
                    if let Some(path) = path {
                        self.compacted_paths.insert(path);
                    }
                }
                report.compacted += 1;
                report.references.push(reference_id);
            }
        }
        if report.compacted > 0 {
            debug!(
                compacted = report.compacted,
                bytes_saved = report.bytes_saved(),
                "microcompacted transcript"
            );
        }
        report
    }

    /// Full original content of a compacted tool result.
    pub fn retrieve(&self, reference_id: &str) -> Option<String> {
        self.lookaside.get(reference_id).map(|entry| entry.content)
    }

    /// Records a read of `path`. Returns true when it re-reads a file whose
    /// earlier read was compacted.
    pub fn note_read(&mut self, path: &str) -> bool {
        if self.compacted_paths.contains(&normalize_path(path)) {
            self.rereads += 1;
            true
        } else {
            false
        }
    }

    pub fn rereads(&self) -> u64 {
        self.rereads
    }
}
