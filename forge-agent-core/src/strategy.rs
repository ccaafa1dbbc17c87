//! Strategy selection and per-strategy budgets.

use forge_protocol::Strategy;
use serde::Serialize;

/// Rough size of a request, used to pick the starting strategy and to
/// decide whether stalls justify escalation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Moderate,
    Complex,
}

const COMPLEX_MARKERS: &[&str] = &[
    "refactor",
    "redesign",
    "rewrite",
    "migrate",
    "across",
    "every ",
    "all sections",
    "entire",
    "whole",
    "multiple",
];

const MODERATE_MARKERS: &[&str] = &[
    "add ",
    "create",
    "implement",
    "build",
    "section",
    "template",
    "and ",
    "new ",
];

const QUESTION_MARKERS: &[&str] = &[
    "what ",
    "why ",
    "how does",
    "how do",
    "explain",
    "where is",
    "which ",
    "can you tell",
    "describe",
];

const CODE_MARKERS: &[&str] = &[
    "fix",
    "change",
    "update",
    "add",
    "remove",
    "delete",
    "create",
    "make",
    "set",
    "rename",
    "move",
    "edit",
    "replace",
    "implement",
    "refactor",
];

impl ComplexityTier {
    pub fn classify(request: &str) -> Self {
        let lower = request.to_lowercase();
        let words = lower.split_whitespace().count();
        if words > 60 || COMPLEX_MARKERS.iter().any(|marker| lower.contains(marker)) {
            ComplexityTier::Complex
        } else if words > 20 || MODERATE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            ComplexityTier::Moderate
        } else {
            ComplexityTier::Trivial
        }
    }

    pub fn is_trivial(self) -> bool {
        self == ComplexityTier::Trivial
    }

    pub fn initial_strategy(self) -> Strategy {
        match self {
            ComplexityTier::Trivial => Strategy::Simple,
            ComplexityTier::Moderate => Strategy::Hybrid,
            ComplexityTier::Complex => Strategy::GodMode,
        }
    }
}

/// Whether the request asks for edits or only for an answer. Edit-oriented
/// policies apply to code mode only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Code,
    Question,
}

impl Intent {
    pub fn classify(request: &str) -> Self {
        let lower = request.trim().to_lowercase();
        let asks_for_edit = CODE_MARKERS.iter().any(|marker| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == *marker)
        });
        if asks_for_edit {
            return Intent::Code;
        }
        let is_question = lower.ends_with('?')
            || QUESTION_MARKERS
                .iter()
                .any(|marker| lower.starts_with(marker));
        if is_question { Intent::Question } else { Intent::Code }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrategyProfile {
    pub max_iterations: u32,
    /// Tool calls allowed over the whole execution.
    pub tool_budget: u32,
    /// Consecutive read-only iterations before the loop breaker fires.
    pub read_only_threshold: u32,
    pub rethink_cap: u32,
    pub allow_delegation: bool,
}

impl StrategyProfile {
    pub fn for_strategy(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Simple => Self {
                max_iterations: 12,
                tool_budget: 24,
                read_only_threshold: 3,
                rethink_cap: 1,
                allow_delegation: false,
            },
            Strategy::Hybrid => Self {
                max_iterations: 20,
                tool_budget: 60,
                read_only_threshold: 2,
                rethink_cap: 2,
                allow_delegation: true,
            },
            Strategy::GodMode => Self {
                max_iterations: 30,
                tool_budget: 120,
                read_only_threshold: 1,
                rethink_cap: 3,
                allow_delegation: true,
            },
        }
    }
}
