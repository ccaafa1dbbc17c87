//! Project-wide verification oracle.

use std::collections::BTreeMap;

use forge_protocol::execution::Severity;
use serde::Serialize;

use super::liquid::SyntaxChecker;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OracleIssue {
    pub path: String,
    pub line: Option<usize>,
    pub severity: Severity,
    pub check: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OracleReport {
    pub passed: bool,
    pub error_count: usize,
    pub warning_count: usize,
    pub issues: Vec<OracleIssue>,
}

impl OracleReport {
    pub fn from_issues(issues: Vec<OracleIssue>) -> Self {
        let error_count = issues.iter().filter(|i| i.severity == Severity::Error).count();
        let warning_count = issues.iter().filter(|i| i.severity == Severity::Warning).count();
        Self {
            passed: error_count == 0,
            error_count,
            warning_count,
            issues,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &OracleIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }
}

/// Pure function of file content, evaluated for both the baseline and the
/// projected project.
pub trait VerificationOracle: Send + Sync {
    fn check(&self, files: &BTreeMap<String, String>) -> OracleReport;
}

/// Runs the Liquid syntax checker over every template plus the layout
/// requirements.
#[derive(Clone, Debug, Default)]
pub struct LintOracle {
    checker: SyntaxChecker,
}

pub const THEME_LAYOUT: &str = "layout/theme.liquid";

impl LintOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VerificationOracle for LintOracle {
    fn check(&self, files: &BTreeMap<String, String>) -> OracleReport {
        let mut issues = Vec::new();
        for (path, content) in files {
            if !SyntaxChecker::applies_to(path) {
                continue;
            }
            for issue in self.checker.check(content) {
                issues.push(OracleIssue {
                    path: path.clone(),
                    line: Some(issue.line),
                    severity: Severity::Error,
                    check: "LiquidSyntax".to_string(),
                    message: issue.message,
                });
            }
            if content.contains("{% include") || content.contains("{%- include") {
                issues.push(OracleIssue {
                    path: path.clone(),
                    line: None,
                    severity: Severity::Warning,
                    check: "DeprecatedTag".to_string(),
                    message: "`include` is deprecated; use `render`".to_string(),
                });
            }
        }

        if let Some(layout) = files.get(THEME_LAYOUT) {
            for required in ["content_for_header", "content_for_layout"] {
                if !layout.contains(required) {
                    issues.push(OracleIssue {
                        path: THEME_LAYOUT.to_string(),
                        line: None,
                        severity: Severity::Error,
                        check: "RequiredLayoutThemeObject".to_string(),
                        message: format!("layout must output `{{{{ {required} }}}}`"),
                    });
                }
            }
        }
        OracleReport::from_issues(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect()
    }

    #[test]
    fn test_clean_project_passes() {
        let report = LintOracle::new().check(&files(&[
            (THEME_LAYOUT, "{{ content_for_header }}{{ content_for_layout }}"),
            ("sections/header.liquid", "<h1>{{ title }}</h1>"),
            ("templates/index.json", "{{ not checked"),
        ]));
        assert!(report.passed);
        assert_eq!(report.error_count, 0);
    }

    #[test]
    fn test_counts_errors_and_warnings() {
        let report = LintOracle::new().check(&files(&[
            (THEME_LAYOUT, "{{ content_for_layout }}"),
            ("sections/header.liquid", "{% if x %}{% include 'old' %}"),
        ]));
        assert!(!report.passed);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.warning_count, 1);
        assert_eq!(report.errors().count(), 2);
    }
}
