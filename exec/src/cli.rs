use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use forge_core::config::ProjectCheckPolicy;

#[derive(Parser, Debug)]
#[command(name = "forge-exec", version, about = "Run one agent execution against a theme project")]
pub struct Cli {
    /// Action to perform. If omitted, runs a new execution.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Project directory the agent reads and edits.
    #[arg(long = "project", short = 'p', global = true, default_value = ".")]
    pub project: PathBuf,

    /// Identifier used to key persisted file contents. Defaults to the
    /// project directory name.
    #[arg(long = "project-id", global = true)]
    pub project_id: Option<String>,

    /// JSON script of model turns to replay.
    #[arg(long = "fixture", short = 'f', global = true)]
    pub fixture: Option<PathBuf>,

    /// Path to a `config.toml`.
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Where checkpoints, execution records and continuation jobs live.
    /// Defaults to `.forge` inside the project.
    #[arg(long = "state-dir", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Use a fixed execution id instead of a generated one.
    #[arg(long = "execution-id")]
    pub execution_id: Option<String>,

    #[arg(long = "user", default_value = "cli")]
    pub user: String,

    /// Override the wall-clock budget of one hop, in seconds.
    #[arg(long = "wall-clock-secs", global = true)]
    pub wall_clock_secs: Option<u64>,

    /// Override the number of tool calls run concurrently.
    #[arg(long = "fan-out", global = true)]
    pub fan_out: Option<usize>,

    /// When to run the project-wide check during verification.
    #[arg(long = "project-check", value_enum, global = true)]
    pub project_check: Option<ProjectCheckArg>,

    /// Print events and the outcome to stdout as JSONL.
    #[arg(long = "json", global = true, default_value_t = false)]
    pub json: bool,

    /// Log at debug level to stderr.
    #[arg(long = "verbose", short = 'v', global = true, default_value_t = false)]
    pub verbose: bool,

    /// Specifies file where the final response of the agent should be written.
    #[arg(long = "output-last-message", global = true)]
    pub last_message_file: Option<PathBuf>,

    /// Request to run. If not provided as an argument (or if `-` is used),
    /// it is read from stdin.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Continue a checkpointed execution from its pending continuation job.
    Resume(ResumeArgs),
}

#[derive(Debug, clap::Args)]
pub struct ResumeArgs {
    /// Execution id printed when the execution was checkpointed.
    #[arg(value_name = "EXECUTION_ID")]
    pub execution_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ProjectCheckArg {
    Auto,
    Always,
    Never,
}

impl From<ProjectCheckArg> for ProjectCheckPolicy {
    fn from(value: ProjectCheckArg) -> Self {
        match value {
            ProjectCheckArg::Auto => ProjectCheckPolicy::Auto,
            ProjectCheckArg::Always => ProjectCheckPolicy::Always,
            ProjectCheckArg::Never => ProjectCheckPolicy::Never,
        }
    }
}
