//! Runtime configuration.
//!
//! `Config` is the fully resolved form every component reads. It is built by
//! layering an optional `config.toml` (`ConfigToml`, every field optional)
//! and `ConfigOverrides` from the command line on top of the defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq)]
pub struct FileStoreConfig {
    /// Writes to one file within this window collapse into one durable write.
    pub coalesce_window: Duration,
    pub persist_attempts: u32,
    pub persist_backoff_base: Duration,
    /// A write by a different actor within this window is a conflict.
    pub conflict_window: Duration,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(200),
            persist_attempts: 3,
            persist_backoff_base: Duration::from_millis(100),
            conflict_window: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    pub fan_out: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { fan_out: 5 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatcherConfig {
    pub tool_timeout: Duration,
    pub orchestration_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(30),
            orchestration_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactionConfig {
    /// Number of most recent tool-result turns kept verbatim.
    pub hot_tail: usize,
    /// Older tool results larger than this are summarized.
    pub size_threshold: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            hot_tail: 4,
            size_threshold: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointConfig {
    pub ttl: Duration,
    /// Save a progress checkpoint every N iterations.
    pub every_iterations: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(20 * 60),
            every_iterations: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionConfig {
    pub wall_clock: Duration,
    /// Fraction of `wall_clock` after which the loop checkpoints and hands
    /// off to a continuation job.
    pub soft_deadline_ratio: f64,
    pub record_ttl: Duration,
    pub context_clear_threshold: u64,
    /// Fraction of `context_clear_threshold` at which a memory anchor is
    /// injected.
    pub anchor_ratio: f64,
    pub stream_idle_timeout: Duration,
    pub max_sub_agent_iterations: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(300),
            soft_deadline_ratio: 0.8,
            record_ttl: Duration::from_secs(60 * 60),
            context_clear_threshold: 150_000,
            anchor_ratio: 0.75,
            stream_idle_timeout: Duration::from_secs(60),
            max_sub_agent_iterations: 6,
        }
    }
}

/// Thresholds for the loop's corrective policies.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyConfig {
    pub edit_sla_soft: u32,
    pub edit_sla_hard: u32,
    pub stagnation_iterations: u32,
    pub mutation_failure_snippet: u32,
    pub mutation_failure_disable: u32,
    pub exclusion_expiry_iterations: u32,
    pub premature_stop_nudges: u32,
    pub escalation_stall_iterations: u32,
    pub max_read_only_nudges: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            edit_sla_soft: 8,
            edit_sla_hard: 16,
            stagnation_iterations: 3,
            mutation_failure_snippet: 3,
            mutation_failure_disable: 5,
            exclusion_expiry_iterations: 6,
            premature_stop_nudges: 2,
            escalation_stall_iterations: 4,
            max_read_only_nudges: 3,
        }
    }
}

/// When the whole-project structural check runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectCheckPolicy {
    /// Only when the project has a layout entry point.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerificationConfig {
    pub project_check: ProjectCheckPolicy,
    /// Cross-file finding categories that discard every change.
    pub blocking_categories: Vec<String>,
    pub baseline_cache_ttl: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            project_check: ProjectCheckPolicy::Auto,
            blocking_categories: vec!["invalid_schema".to_string()],
            baseline_cache_ttl: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub file_store: FileStoreConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub compaction: CompactionConfig,
    pub checkpoint: CheckpointConfig,
    pub execution: ExecutionConfig,
    pub policies: PolicyConfig,
    pub verification: VerificationConfig,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FileStoreToml {
    pub coalesce_window_ms: Option<u64>,
    pub persist_attempts: Option<u32>,
    pub persist_backoff_ms: Option<u64>,
    pub conflict_window_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SchedulerToml {
    pub fan_out: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DispatcherToml {
    pub tool_timeout_secs: Option<u64>,
    pub orchestration_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CompactionToml {
    pub hot_tail: Option<usize>,
    pub size_threshold: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CheckpointToml {
    pub ttl_secs: Option<u64>,
    pub every_iterations: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionToml {
    pub wall_clock_secs: Option<u64>,
    pub soft_deadline_ratio: Option<f64>,
    pub record_ttl_secs: Option<u64>,
    pub context_clear_threshold: Option<u64>,
    pub anchor_ratio: Option<f64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub max_sub_agent_iterations: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PolicyToml {
    pub edit_sla_soft: Option<u32>,
    pub edit_sla_hard: Option<u32>,
    pub stagnation_iterations: Option<u32>,
    pub exclusion_expiry_iterations: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VerificationToml {
    pub project_check: Option<ProjectCheckPolicy>,
    pub blocking_categories: Option<Vec<String>>,
}

/// On-disk shape of `config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ConfigToml {
    #[serde(default)]
    pub file_store: FileStoreToml,
    #[serde(default)]
    pub scheduler: SchedulerToml,
    #[serde(default)]
    pub dispatcher: DispatcherToml,
    #[serde(default)]
    pub compaction: CompactionToml,
    #[serde(default)]
    pub checkpoint: CheckpointToml,
    #[serde(default)]
    pub execution: ExecutionToml,
    #[serde(default)]
    pub policies: PolicyToml,
    #[serde(default)]
    pub verification: VerificationToml,
}

/// Optional overrides supplied on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub wall_clock_secs: Option<u64>,
    pub fan_out: Option<usize>,
    pub project_check: Option<ProjectCheckPolicy>,
}

impl ConfigToml {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

impl Config {
    /// Reads `path` when given and layers `overrides` on top of it.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                ConfigToml::from_toml_str(&raw)?
            }
            None => ConfigToml::default(),
        };
        Self::load_from_base_config_with_overrides(cfg, overrides)
    }

    pub fn load_from_base_config_with_overrides(
        cfg: ConfigToml,
        overrides: ConfigOverrides,
    ) -> Result<Self> {
        let defaults = Config::default();

        let file_store = FileStoreConfig {
            coalesce_window: cfg
                .file_store
                .coalesce_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.file_store.coalesce_window),
            persist_attempts: cfg
                .file_store
                .persist_attempts
                .unwrap_or(defaults.file_store.persist_attempts)
                .max(1),
            persist_backoff_base: cfg
                .file_store
                .persist_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.file_store.persist_backoff_base),
            conflict_window: cfg
                .file_store
                .conflict_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.file_store.conflict_window),
        };

        let fan_out = overrides
            .fan_out
            .or(cfg.scheduler.fan_out)
            .unwrap_or(defaults.scheduler.fan_out)
            .max(1);

        let dispatcher = DispatcherConfig {
            tool_timeout: cfg
                .dispatcher
                .tool_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatcher.tool_timeout),
            orchestration_timeout: cfg
                .dispatcher
                .orchestration_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatcher.orchestration_timeout),
        };

        let compaction = CompactionConfig {
            hot_tail: cfg.compaction.hot_tail.unwrap_or(defaults.compaction.hot_tail),
            size_threshold: cfg
                .compaction
                .size_threshold
                .unwrap_or(defaults.compaction.size_threshold),
        };

        let checkpoint = CheckpointConfig {
            ttl: cfg
                .checkpoint
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.checkpoint.ttl),
            every_iterations: cfg
                .checkpoint
                .every_iterations
                .unwrap_or(defaults.checkpoint.every_iterations)
                .max(1),
        };

        let soft_deadline_ratio = cfg
            .execution
            .soft_deadline_ratio
            .unwrap_or(defaults.execution.soft_deadline_ratio);
        if !(0.0..=1.0).contains(&soft_deadline_ratio) {
            return Err(crate::error::ForgeErr::Config(format!(
                "execution.soft_deadline_ratio must be within 0..=1, got {soft_deadline_ratio}"
            )));
        }
        let anchor_ratio = cfg.execution.anchor_ratio.unwrap_or(defaults.execution.anchor_ratio);
        if !(0.0..=1.0).contains(&anchor_ratio) {
            return Err(crate::error::ForgeErr::Config(format!(
                "execution.anchor_ratio must be within 0..=1, got {anchor_ratio}"
            )));
        }

        let execution = ExecutionConfig {
            wall_clock: overrides
                .wall_clock_secs
                .or(cfg.execution.wall_clock_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.execution.wall_clock),
            soft_deadline_ratio,
            record_ttl: cfg
                .execution
                .record_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.execution.record_ttl),
            context_clear_threshold: cfg
                .execution
                .context_clear_threshold
                .unwrap_or(defaults.execution.context_clear_threshold),
            anchor_ratio,
            stream_idle_timeout: cfg
                .execution
                .stream_idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.execution.stream_idle_timeout),
            max_sub_agent_iterations: cfg
                .execution
                .max_sub_agent_iterations
                .unwrap_or(defaults.execution.max_sub_agent_iterations),
        };

        let policies = PolicyConfig {
            edit_sla_soft: cfg.policies.edit_sla_soft.unwrap_or(defaults.policies.edit_sla_soft),
            edit_sla_hard: cfg.policies.edit_sla_hard.unwrap_or(defaults.policies.edit_sla_hard),
            stagnation_iterations: cfg
                .policies
                .stagnation_iterations
                .unwrap_or(defaults.policies.stagnation_iterations),
            exclusion_expiry_iterations: cfg
                .policies
                .exclusion_expiry_iterations
                .unwrap_or(defaults.policies.exclusion_expiry_iterations),
            ..defaults.policies
        };

        let verification = VerificationConfig {
            project_check: overrides
                .project_check
                .or(cfg.verification.project_check)
                .unwrap_or_default(),
            blocking_categories: cfg
                .verification
                .blocking_categories
                .unwrap_or(defaults.verification.blocking_categories),
            baseline_cache_ttl: defaults.verification.baseline_cache_ttl,
        };

        Ok(Self {
            file_store,
            scheduler: SchedulerConfig { fan_out },
            dispatcher,
            compaction,
            checkpoint,
            execution,
            policies,
            verification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg = ConfigToml::from_toml_str("").unwrap();
        let config =
            Config::load_from_base_config_with_overrides(cfg, ConfigOverrides::default()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_toml_sections_apply() {
        let cfg = ConfigToml::from_toml_str(
            r#"
[file_store]
coalesce_window_ms = 50

[scheduler]
fan_out = 2

[verification]
project_check = "always"
"#,
        )
        .unwrap();
        let config =
            Config::load_from_base_config_with_overrides(cfg, ConfigOverrides::default()).unwrap();
        assert_eq!(config.file_store.coalesce_window, Duration::from_millis(50));
        assert_eq!(config.scheduler.fan_out, 2);
        assert_eq!(config.verification.project_check, ProjectCheckPolicy::Always);
        assert_eq!(config.file_store.persist_attempts, 3);
    }

    #[test]
    fn test_overrides_win_over_toml() {
        let cfg = ConfigToml::from_toml_str("[execution]\nwall_clock_secs = 120\n").unwrap();
        let overrides = ConfigOverrides {
            wall_clock_secs: Some(30),
            fan_out: Some(0),
            project_check: None,
        };
        let config = Config::load_from_base_config_with_overrides(cfg, overrides).unwrap();
        assert_eq!(config.execution.wall_clock, Duration::from_secs(30));
        assert_eq!(config.scheduler.fan_out, 1);
    }

    #[test]
    fn test_rejects_out_of_range_ratio() {
        let cfg = ConfigToml::from_toml_str("[execution]\nsoft_deadline_ratio = 1.5\n").unwrap();
        let err = Config::load_from_base_config_with_overrides(cfg, ConfigOverrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("soft_deadline_ratio"));
    }

    #[test]
    fn test_unknown_key_type_is_config_error() {
        let err = ConfigToml::from_toml_str("[scheduler]\nfan_out = \"many\"\n").unwrap_err();
        assert!(matches!(err, crate::error::ForgeErr::Config(_)));
    }
}
