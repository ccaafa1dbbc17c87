//! Cross-file consistency checks over the projected project.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::Serialize;
use serde_json::Value;

pub const MISSING_SNIPPET: &str = "missing_snippet";
pub const MISSING_SECTION: &str = "missing_section";
pub const INVALID_SCHEMA: &str = "invalid_schema";
pub const INVALID_TEMPLATE_JSON: &str = "invalid_template_json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsistencyFinding {
    pub path: String,
    pub line: Option<usize>,
    pub category: String,
    pub message: String,
}

#[allow(clippy::expect_used)]
fn render_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{%-?\s*(?:render|include)\s+['"]([^'"]+)['"]"#).expect("valid render regex")
    })
}

#[allow(clippy::expect_used)]
fn section_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{%-?\s*section\s+['"]([^'"]+)['"]"#).expect("valid section regex")
    })
}

#[allow(clippy::expect_used)]
fn schema_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\{%-?\s*schema\s*-?%\}(.*?)\{%-?\s*endschema\s*-?%\}")
            .expect("valid schema regex")
    })
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn snippet_path(name: &str) -> String {
    format!("snippets/{name}.liquid")
}

fn section_path(name: &str) -> String {
    format!("sections/{name}.liquid")
}

/// Runs the checks for every path in `changed` against `files` (the
/// projected project). Deleted paths are absent from `files`; references
/// to them from unchanged files are reported too.
pub fn check_consistency(
    files: &BTreeMap<String, String>,
    changed: &BTreeSet<String>,
) -> Vec<ConsistencyFinding> {
    let mut findings = Vec::new();

    for path in changed {
        let Some(content) = files.get(path) else {
            continue;
        };
        if path.ends_with(".liquid") {
            check_references(path, content, files, &mut findings);
            check_schema(path, content, &mut findings);
        } else if path.starts_with("templates/") && path.ends_with(".json") {
            check_template(path, content, files, &mut findings);
        }
    }

    let deleted: BTreeSet<&String> = changed
        .iter()
        .filter(|path| !files.contains_key(*path))
        .collect();
    if !deleted.is_empty() {
        for (path, content) in files {
            if changed.contains(path) || !path.ends_with(".liquid") {
                continue;
            }
            let mut dangling = Vec::new();
            check_references(path, content, files, &mut dangling);
            findings.extend(dangling.into_iter().filter(|finding| {
                deleted
                    .iter()
                    .any(|deleted_path| finding.message.contains(deleted_path.as_str()))
            }));
        }
    }

    findings
}

fn check_references(
    path: &str,
    content: &str,
    files: &BTreeMap<String, String>,
    findings: &mut Vec<ConsistencyFinding>,
) {
    for captures in render_regex().captures_iter(content) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let target = snippet_path(name.as_str());
        if !files.contains_key(&target) {
            findings.push(ConsistencyFinding {
                path: path.to_string(),
                line: Some(line_of(content, whole.start())),
                category: MISSING_SNIPPET.to_string(),
                message: format!("renders `{}` but {target} does not exist", name.as_str()),
            });
        }
    }
    for captures in section_regex().captures_iter(content) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let target = section_path(name.as_str());
        if !files.contains_key(&target) {
            findings.push(ConsistencyFinding {
                path: path.to_string(),
                line: Some(line_of(content, whole.start())),
                category: MISSING_SECTION.to_string(),
                message: format!(
                    "includes section `{}` but {target} does not exist",
                    name.as_str()
                ),
            });
        }
    }
}

fn check_schema(path: &str, content: &str, findings: &mut Vec<ConsistencyFinding>) {
    for captures in schema_regex().captures_iter(content) {
        let Some(body) = captures.get(1) else {
            continue;
        };
        if let Err(err) = serde_json::from_str::<Value>(body.as_str()) {
            findings.push(ConsistencyFinding {
                path: path.to_string(),
                line: Some(line_of(content, body.start())),
                category: INVALID_SCHEMA.to_string(),
                message: format!("schema block is not valid JSON: {err}"),
            });
        }
    }
}

fn check_template(
    path: &str,
    content: &str,
    files: &BTreeMap<String, String>,
    findings: &mut Vec<ConsistencyFinding>,
) {
    let template: Value = match serde_json::from_str(content) {
        Ok(value) => value,
        Err(err) => {
            findings.push(ConsistencyFinding {
                path: path.to_string(),
                line: Some(err.line()),
                category: INVALID_TEMPLATE_JSON.to_string(),
                message: format!("template is not valid JSON: {err}"),
            });
            return;
        }
    };
    let Some(sections) = template.get("sections").and_then(Value::as_object) else {
        return;
    };
    for (key, section) in sections {
        let Some(section_type) = section.get("type").and_then(Value::as_str) else {
            continue;
        };
        let target = section_path(section_type);
        if !files.contains_key(&target) {
            findings.push(ConsistencyFinding {
                path: path.to_string(),
                line: None,
                category: MISSING_SECTION.to_string(),
                message: format!(
                    "section `{key}` uses type `{section_type}` but {target} does not exist"
                ),
            });
        }
    }
}
