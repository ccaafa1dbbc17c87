//! Structural syntax checker for Liquid templates.
//!
//! Checks delimiter balance for `{{ }}` and `{% %}` and pairing of block
//! tags. It does not evaluate expressions.

use serde::Serialize;

/// Tags that open a block closed by `end<tag>`.
const BLOCK_TAGS: &[&str] = &[
    "if",
    "unless",
    "for",
    "case",
    "capture",
    "form",
    "paginate",
    "tablerow",
];

/// Block tags whose body is opaque text until the matching end tag.
const RAW_TAGS: &[&str] = &["raw", "comment", "schema", "javascript", "stylesheet"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyntaxIssue {
    pub line: usize,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyntaxChecker;

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

/// Position of `close` at or after `from`, unless another opening delimiter
/// appears first.
fn find_close(source: &str, from: usize, close: &str) -> Option<usize> {
    let rest = &source[from..];
    let close_at = rest.find(close)?;
    let next_open = [rest.find("{{"), rest.find("{%")].into_iter().flatten().min();
    match next_open {
        Some(open_at) if open_at < close_at => None,
        _ => Some(from + close_at),
    }
}

/// Tag name of a `{% ... %}` body, with whitespace control stripped.
fn tag_name(inner: &str) -> &str {
    let trimmed = inner.trim_matches(|c: char| c == '-' || c.is_whitespace());
    trimmed.split_whitespace().next().unwrap_or_default()
}

/// Finds the end of a raw-like block body starting at `from`. Returns the
/// offset just past the closing tag.
fn find_raw_end(source: &str, from: usize, tag: &str) -> Option<usize> {
    let end_name = format!("end{tag}");
    let mut cursor = from;
    while let Some(rel) = source[cursor..].find("{%") {
        let start = cursor + rel;
        let close = source[start + 2..].find("%}")? + start + 2;
        if tag_name(&source[start + 2..close]) == end_name {
            return Some(close + 2);
        }
        cursor = start + 2;
    }
    None
}

impl SyntaxChecker {
    pub fn new() -> Self {
        Self
    }

    /// Only Liquid templates are checked.
    pub fn applies_to(path: &str) -> bool {
        path.ends_with(".liquid")
    }

    pub fn check(&self, source: &str) -> Vec<SyntaxIssue> {
        let mut issues = Vec::new();
        let mut stack: Vec<(String, usize)> = Vec::new();
        let mut cursor = 0;

        while let Some(rel) = source[cursor..].find('{') {
            let start = cursor + rel;
            let rest = &source[start..];
            if rest.starts_with("{{") {
                match find_close(source, start + 2, "}}") {
                    Some(end) => cursor = end + 2,
                    None => {
                        issues.push(SyntaxIssue {
                            line: line_of(source, start),
                            message: "output tag `{{` is never closed with `}}`".to_string(),
                        });
                        cursor = start + 2;
                    }
                }
            } else if rest.starts_with("{%") {
                let Some(end) = find_close(source, start + 2, "%}") else {
                    issues.push(SyntaxIssue {
                        line: line_of(source, start),
                        message: "tag `{%` is never closed with `%}`".to_string(),
                    });
                    cursor = start + 2;
                    continue;
                };
                let line = line_of(source, start);
                let name = tag_name(&source[start + 2..end]);
                cursor = end + 2;

                if RAW_TAGS.contains(&name) {
                    match find_raw_end(source, cursor, name) {
                        Some(after) => cursor = after,
                        None => {
                            issues.push(SyntaxIssue {
                                line,
                                message: format!(
                                    "`{{% {name} %}}` is never closed with `{{% end{name} %}}`"
                                ),
                            });
                            break;
                        }
                    }
                } else if BLOCK_TAGS.contains(&name) {
                    stack.push((name.to_string(), line));
                } else if let Some(opened) = name.strip_prefix("end") {
                    self.close_block(opened, line, &mut stack, &mut issues);
                } else if matches!(name, "else" | "elsif" | "when") {
                    let parent = stack.last().map(|(tag, _)| tag.as_str());
                    let allowed = match name {
                        "elsif" => matches!(parent, Some("if" | "unless")),
                        "when" => matches!(parent, Some("case")),
                        _ => matches!(parent, Some("if" | "unless" | "for" | "case")),
                    };
                    if !allowed {
                        issues.push(SyntaxIssue {
                            line,
                            message: format!("`{{% {name} %}}` outside of a matching block"),
                        });
                    }
                }
            } else {
                cursor = start + 1;
            }
        }

        for (tag, line) in stack {
            issues.push(SyntaxIssue {
                line,
                message: format!("`{{% {tag} %}}` is never closed with `{{% end{tag} %}}`"),
            });
        }
        issues.sort_by_key(|issue| issue.line);
        issues
    }

    fn close_block(
        &self,
        opened: &str,
        line: usize,
        stack: &mut Vec<(String, usize)>,
        issues: &mut Vec<SyntaxIssue>,
    ) {
        match stack.iter().rposition(|(tag, _)| tag == opened) {
            Some(index) => {
                for (tag, open_line) in stack.drain(index + 1..) {
                    issues.push(SyntaxIssue {
                        line: open_line,
                        message: format!(
                            "`{{% {tag} %}}` is never closed before `{{% end{opened} %}}` on line {line}"
                        ),
                    });
                }
                stack.pop();
            }
            None => issues.push(SyntaxIssue {
                line,
                message: format!("`{{% end{opened} %}}` has no matching `{{% {opened} %}}`"),
            }),
        }
    }
}
