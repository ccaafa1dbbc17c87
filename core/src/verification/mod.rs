//! Post-loop verification gate.
//!
//! Runs, in order: a syntax check of every changed file, an optional
//! whole-project check comparing baseline and projected error counts, and
//! cross-file consistency checks. Only newly introduced errors and blocking
//! cross-file categories discard the change set. A final file-context rule
//! drops individual changes to files the session never read.

mod consistency;
mod liquid;
mod oracle;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use forge_protocol::Change;
use forge_protocol::ChangeKind;
use forge_protocol::ValidationIssue;
use forge_protocol::execution::IssueKind;
use forge_protocol::execution::Severity;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;

pub use consistency::ConsistencyFinding;
pub use consistency::INVALID_SCHEMA;
pub use consistency::INVALID_TEMPLATE_JSON;
pub use consistency::MISSING_SECTION;
pub use consistency::MISSING_SNIPPET;
pub use consistency::check_consistency;
pub use liquid::SyntaxChecker;
pub use liquid::SyntaxIssue;
pub use oracle::LintOracle;
pub use oracle::OracleIssue;
pub use oracle::OracleReport;
pub use oracle::THEME_LAYOUT;
pub use oracle::VerificationOracle;

use crate::cache::TtlCache;
use crate::config::ProjectCheckPolicy;
use crate::config::VerificationConfig;

pub struct VerificationInputs {
    pub project_id: String,
    pub changes: Vec<Change>,
    /// Project content before any change of this execution.
    pub baseline: BTreeMap<String, String>,
    /// Paths read during the session.
    pub reads: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub changes_kept: bool,
    pub kept: Vec<Change>,
    pub discarded: Vec<Change>,
    pub issues: Vec<ValidationIssue>,
    pub baseline_errors: Option<usize>,
    pub projected_errors: Option<usize>,
    pub new_errors: usize,
    /// Human-readable reason when the change set was discarded.
    pub explanation: Option<String>,
}

pub struct VerificationGate {
    oracle: Arc<dyn VerificationOracle>,
    checker: SyntaxChecker,
    config: VerificationConfig,
    baseline_cache: TtlCache<String, OracleReport>,
}

/// Digest of a project snapshot, so a cached baseline only answers for the
/// exact content it was computed from.
fn snapshot_digest(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn apply_changes(
    baseline: &BTreeMap<String, String>,
    changes: &[Change],
) -> BTreeMap<String, String> {
    let mut projected = baseline.clone();
    for change in changes {
        match change.kind {
            ChangeKind::Delete => {
                projected.remove(&change.file_name);
            }
            ChangeKind::Modify | ChangeKind::Create => {
                projected.insert(change.file_name.clone(), change.proposed_content.clone());
            }
        }
    }
    projected
}

impl VerificationGate {
    pub fn new(oracle: Arc<dyn VerificationOracle>, config: VerificationConfig) -> Self {
        let baseline_cache = TtlCache::new(config.baseline_cache_ttl);
        Self {
            oracle,
            checker: SyntaxChecker::new(),
            config,
            baseline_cache,
        }
    }

    /// Gate backed by the built-in [`LintOracle`].
    pub fn with_lint_oracle(config: VerificationConfig) -> Self {
        Self::new(Arc::new(LintOracle::new()), config)
    }

    /// Drops every cached baseline of a project whose files changed.
    pub fn invalidate_project(&self, project_id: &str) {
        let dropped = self.baseline_cache.invalidate_prefix(&format!("{project_id}:"));
        if dropped > 0 {
            debug!(project_id, dropped, "invalidated baseline cache");
        }
    }

    fn project_check_applies(
        &self,
        baseline: &BTreeMap<String, String>,
        projected: &BTreeMap<String, String>,
    ) -> bool {
        match self.config.project_check {
            ProjectCheckPolicy::Always => true,
            ProjectCheckPolicy::Never => false,
            ProjectCheckPolicy::Auto => {
                baseline.contains_key(THEME_LAYOUT) || projected.contains_key(THEME_LAYOUT)
            }
        }
    }

    fn baseline_report(
        &self,
        project_id: &str,
        baseline: &BTreeMap<String, String>,
    ) -> OracleReport {
        let key = format!("{project_id}:{}", snapshot_digest(baseline));
        if let Some(report) = self.baseline_cache.get(&key) {
            return report;
        }
        let report = self.oracle.check(baseline);
        self.baseline_cache.insert(key, report.clone());
        report
    }

    pub fn verify(&self, inputs: VerificationInputs) -> VerificationOutcome {
        let VerificationInputs {
            project_id,
            changes,
            baseline,
            reads,
        } = inputs;
        let mut outcome = VerificationOutcome {
            changes_kept: true,
            ..VerificationOutcome::default()
        };
        if changes.is_empty() {
            return outcome;
        }

        // Syntax over every changed template.
        let mut syntax_new = 0usize;
        for change in &changes {
            if change.kind == ChangeKind::Delete || !SyntaxChecker::applies_to(&change.file_name) {
                continue;
            }
            let proposed = self.checker.check(&change.proposed_content);
            let original = match change.kind {
                ChangeKind::Create => 0,
                _ => self.checker.check(&change.original_content).len(),
            };
            syntax_new += proposed.len().saturating_sub(original);
            for issue in proposed {
                outcome.issues.push(
                    ValidationIssue::new(IssueKind::Syntax, Severity::Error, issue.message)
                        .with_file(change.file_name.clone())
                        .with_line(issue.line),
                );
            }
        }

        // Baseline versus projected project.
        let projected = apply_changes(&baseline, &changes);
        let new_errors = if self.project_check_applies(&baseline, &projected) {
            let before = self.baseline_report(&project_id, &baseline);
            let after = self.oracle.check(&projected);
            outcome.baseline_errors = Some(before.error_count);
            outcome.projected_errors = Some(after.error_count);
            if before.error_count > 0 {
                outcome.issues.push(
                    ValidationIssue::new(
                        IssueKind::ThemeCheck,
                        Severity::Info,
                        format!(
                            "{} pre-existing error(s) were found in the project; they were not introduced by these changes",
                            before.error_count
                        ),
                    )
                    .with_category("pre_existing"),
                );
            }
            after.error_count.saturating_sub(before.error_count)
        } else {
            syntax_new
        };
        outcome.new_errors = new_errors;

        if new_errors > 0 {
            let details: Vec<String> = outcome
                .issues
                .iter()
                .filter(|issue| issue.severity == Severity::Error)
                .take(5)
                .map(|issue| match (&issue.file, issue.line) {
                    (Some(file), Some(line)) => format!("{file}:{line}: {}", issue.message),
                    (Some(file), None) => format!("{file}: {}", issue.message),
                    _ => issue.message.clone(),
                })
                .collect();
            outcome.issues.push(
                ValidationIssue::new(
                    IssueKind::ThemeCheck,
                    Severity::Error,
                    format!("{new_errors} newly introduced error(s); all changes were discarded"),
                )
                .with_category("new_errors"),
            );
            let mut explanation = format!(
                "The verification gate rejected the proposed changes: they introduce {new_errors} new error(s). All changes were discarded."
            );
            if !details.is_empty() {
                explanation.push('\n');
                explanation.push_str(&details.join("\n"));
            }
            info!(project_id, new_errors, "verification gate discarded changes");
            return Self::discard_all(outcome, changes, explanation);
        }

        // Cross-file consistency.
        let changed: BTreeSet<String> =
            changes.iter().map(|change| change.file_name.clone()).collect();
        let mut blocking = Vec::new();
        for finding in check_consistency(&projected, &changed) {
            let is_blocking = self.config.blocking_categories.contains(&finding.category);
            let severity = if is_blocking { Severity::Error } else { Severity::Warning };
            let mut issue =
                ValidationIssue::new(IssueKind::CrossFile, severity, finding.message.clone())
                    .with_file(finding.path.clone())
                    .with_category(finding.category.clone());
            if let Some(line) = finding.line {
                issue = issue.with_line(line);
            }
            outcome.issues.push(issue);
            if is_blocking {
                blocking.push(finding);
            }
        }
        if !blocking.is_empty() {
            let details: Vec<String> = blocking
                .iter()
                .map(|finding| {
                    format!("{} ({}): {}", finding.path, finding.category, finding.message)
                })
                .collect();
            let explanation = format!(
                "The verification gate rejected the proposed changes because the cross-file check found blocking problems. All changes were discarded.\n{}",
                details.join("\n")
            );
            info!(project_id, blocking = blocking.len(), "cross-file check discarded changes");
            return Self::discard_all(outcome, changes, explanation);
        }

        // File-context rule.
        for change in changes {
            if change.kind != ChangeKind::Create && !reads.contains(&change.file_name) {
                outcome.issues.push(
                    ValidationIssue::new(
                        IssueKind::OutOfContext,
                        Severity::Warning,
                        format!(
                            "change to {} was rejected because the file was never read in this session",
                            change.file_name
                        ),
                    )
                    .with_file(change.file_name.clone()),
                );
                outcome.discarded.push(change);
            } else {
                outcome.kept.push(change);
            }
        }
        outcome
    }

    fn discard_all(
        mut outcome: VerificationOutcome,
        changes: Vec<Change>,
        explanation: String,
    ) -> VerificationOutcome {
        outcome.changes_kept = false;
        outcome.kept.clear();
        outcome.discarded = changes;
        outcome.explanation = Some(explanation);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerificationConfig;
    use pretty_assertions::assert_eq;

    const LAYOUT: &str = "<html>{{ content_for_header }}{{ content_for_layout }}</html>";
    const HEADER: &str = "<h1 style=\"color: red\">{{ shop.name }}</h1>";

    fn change(path: &str, original: &str, proposed: &str) -> Change {
        Change {
            file_id: path.to_string(),
            file_name: path.to_string(),
            original_content: original.to_string(),
            proposed_content: proposed.to_string(),
            rationale: "test".to_string(),
            agent: "main".to_string(),
            kind: ChangeKind::Modify,
        }
    }

    fn baseline(extra: &[(&str, &str)]) -> BTreeMap<String, String> {
        let mut files = BTreeMap::from([
            (THEME_LAYOUT.to_string(), LAYOUT.to_string()),
            ("sections/header.liquid".to_string(), HEADER.to_string()),
        ]);
        for (path, content) in extra {
            files.insert(path.to_string(), content.to_string());
        }
        files
    }

    fn reads(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn gate() -> VerificationGate {
        VerificationGate::with_lint_oracle(VerificationConfig::default())
    }

    #[test]
    fn test_clean_change_is_kept() {
        let outcome = gate().verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change(
                "sections/header.liquid",
                HEADER,
                "<h1 style=\"color: blue\">{{ shop.name }}</h1>",
            )],
            baseline: baseline(&[]),
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(outcome.changes_kept);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.issues, Vec::new());
        assert_eq!(outcome.baseline_errors, Some(0));
        assert_eq!(outcome.projected_errors, Some(0));
        assert_eq!(outcome.new_errors, 0);
    }

    #[test]
    fn test_new_errors_discard_everything() {
        let outcome = gate().verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change(
                "sections/header.liquid",
                HEADER,
                "<h1 style=\"color: {{ settings.color }\">\n{% if show %}Hi</h1>",
            )],
            baseline: baseline(&[]),
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(!outcome.changes_kept);
        assert_eq!(outcome.new_errors, 2);
        assert!(outcome.kept.is_empty());
        assert_eq!(outcome.discarded.len(), 1);
        assert!(
            outcome
                .issues
                .iter()
                .any(|issue| {
                    issue.kind == IssueKind::ThemeCheck && issue.severity == Severity::Error
                })
        );
        assert!(outcome.explanation.unwrap().contains("verification gate"));
    }

    #[test]
    fn test_pre_existing_errors_only_warn() {
        let broken = "{% if x %}never closed";
        let outcome = gate().verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change(
                "sections/header.liquid",
                HEADER,
                "<h1 style=\"color: blue\">{{ shop.name }}</h1>",
            )],
            baseline: baseline(&[("sections/legacy.liquid", broken)]),
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(outcome.changes_kept);
        assert_eq!(outcome.baseline_errors, Some(1));
        assert_eq!(outcome.projected_errors, Some(1));
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].severity, Severity::Info);
    }

    #[test]
    fn test_syntax_delta_blocks_without_layout() {
        let mut files = baseline(&[]);
        files.remove(THEME_LAYOUT);
        let outcome = gate().verify(VerificationInputs {
            project_id: "p2".to_string(),
            changes: vec![change("sections/header.liquid", HEADER, "{% for x in y %}")],
            baseline: files,
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(!outcome.changes_kept);
        assert_eq!(outcome.baseline_errors, None);
        assert_eq!(outcome.new_errors, 1);
    }

    #[test]
    fn test_blocking_cross_file_category() {
        let outcome = gate().verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![
                change(
                    "sections/header.liquid",
                    HEADER,
                    "<h1></h1>{% schema %}{\"name\": }{% endschema %}",
                ),
                change("sections/footer.liquid", "", "<footer></footer>"),
            ],
            baseline: baseline(&[("sections/footer.liquid", "")]),
            reads: reads(&["sections/header.liquid", "sections/footer.liquid"]),
        });
        assert!(!outcome.changes_kept);
        assert_eq!(outcome.discarded.len(), 2);
        assert!(outcome.explanation.unwrap().contains(INVALID_SCHEMA));
    }

    #[test]
    fn test_non_blocking_cross_file_warning() {
        let outcome = gate().verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change(
                "sections/header.liquid",
                HEADER,
                "<h1>{% render 'missing-icon' %}</h1>",
            )],
            baseline: baseline(&[]),
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(outcome.changes_kept);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].category.as_deref(), Some(MISSING_SNIPPET));
    }

    #[test]
    fn test_unread_file_change_is_rejected() {
        let mut created = change("snippets/new.liquid", "", "<span></span>");
        created.kind = ChangeKind::Create;
        let outcome = gate().verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![
                change("sections/header.liquid", HEADER, "<h1>{{ shop.name }}</h1>"),
                created,
            ],
            baseline: baseline(&[]),
            reads: reads(&[]),
        });
        assert!(outcome.changes_kept);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].file_name, "snippets/new.liquid");
        assert_eq!(outcome.discarded.len(), 1);
        assert_eq!(outcome.issues[0].kind, IssueKind::OutOfContext);
    }

    #[test]
    fn test_cached_baseline_follows_snapshot_content() {
        let gate = gate();
        let broken_header = "<h1>{% if shop %}{{ shop.name }}</h1>";
        let rejected = gate.verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change("sections/header.liquid", HEADER, broken_header)],
            baseline: baseline(&[]),
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(!rejected.changes_kept);
        assert_eq!(rejected.baseline_errors, Some(0));

        // Same project, no invalidation, but the snapshot now carries a
        // broken file that predates this execution.
        let outcome = gate.verify(VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change(
                "sections/header.liquid",
                HEADER,
                "<h1 style=\"color: blue\">{{ shop.name }}</h1>",
            )],
            baseline: baseline(&[("sections/legacy.liquid", "{% if x %}never closed")]),
            reads: reads(&["sections/header.liquid"]),
        });
        assert!(outcome.changes_kept);
        assert_eq!(outcome.baseline_errors, Some(1));
        assert_eq!(outcome.projected_errors, Some(1));
        assert_eq!(outcome.new_errors, 0);
    }

    #[test]
    fn test_invalidate_project_drops_cached_baselines() {
        let gate = gate();
        let inputs = || VerificationInputs {
            project_id: "p1".to_string(),
            changes: vec![change("sections/header.liquid", HEADER, "<h1>{{ shop.name }}</h1>")],
            baseline: baseline(&[]),
            reads: reads(&["sections/header.liquid"]),
        };
        gate.verify(inputs());
        assert_eq!(gate.baseline_cache.len(), 1);

        gate.invalidate_project("p10");
        assert_eq!(gate.baseline_cache.len(), 1);
        gate.invalidate_project("p1");
        assert!(gate.baseline_cache.is_empty());

        assert_eq!(gate.verify(inputs()).baseline_errors, Some(0));
        assert_eq!(gate.baseline_cache.len(), 1);
    }
}
