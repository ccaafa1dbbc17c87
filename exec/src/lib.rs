mod cli;
mod event_processor;

pub use cli::Cli;
use forge_agent_core::ExecutionDriver;
use forge_agent_core::ExecutionRequest;
use forge_agent_core::FixtureProvider;
use forge_agent_core::JobDispatcher;
use forge_agent_core::KvJobQueue;
use forge_agent_core::LoopEvent;
use forge_agent_core::Outbox;
use forge_agent_core::jobs::LogTrigger;
use forge_core::Config;
use forge_core::ConfigOverrides;
use forge_core::FsStore;
use forge_core::KvStore;
use forge_core::file_store::DirMirror;
use forge_core::file_store::FileRef;
use forge_core::file_store::KvFileBackend;
use std::io::IsTerminal;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use walkdir::DirEntry;
use walkdir::WalkDir;

use crate::cli::Command as ExecCommand;
use crate::event_processor::EventProcessor;
use crate::event_processor::EventProcessorWithHumanOutput;
use crate::event_processor::EventProcessorWithJsonOutput;
use crate::event_processor::RunSummary;
use crate::event_processor::exit_code;
use crate::event_processor::handle_last_message;
use anyhow::Context;
use anyhow::bail;

const STATE_DIR: &str = ".forge";

pub async fn run_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let Cli {
        command,
        project,
        project_id,
        fixture,
        config: config_path,
        state_dir,
        execution_id,
        user,
        wall_clock_secs,
        fan_out,
        project_check,
        json: json_mode,
        verbose,
        last_message_file,
        prompt,
    } = cli;

    // Establish default log level for the tracing layer. RUST_LOG wins
    // unless --verbose was passed.
    let default_level = if verbose { "debug" } else { "warn" };
    let env_filter = if verbose {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();

    let Some(fixture) = fixture else {
        bail!("--fixture is required: forge-exec replays a scripted model");
    };
    let provider = FixtureProvider::from_path(&fixture)
        .with_context(|| format!("failed to load fixture {}", fixture.display()))?;

    let overrides = ConfigOverrides {
        wall_clock_secs,
        fan_out,
        project_check: project_check.map(Into::into),
    };
    let config = Config::load(config_path.as_deref(), overrides)
        .context("failed to load configuration")?;

    let project = project
        .canonicalize()
        .with_context(|| format!("project directory {} not found", project.display()))?;
    let state_dir = state_dir.unwrap_or_else(|| project.join(STATE_DIR));
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state directory {}", state_dir.display()))?;
    let kv: Arc<dyn KvStore> = Arc::new(FsStore::new(&state_dir));
    let jobs = Arc::new(JobDispatcher::new(
        Arc::new(KvJobQueue::new(Arc::clone(&kv), Some(config.checkpoint.ttl))),
        Arc::new(LogTrigger),
    ));

    let (request, resumed) = match command {
        Some(ExecCommand::Resume(args)) => {
            let Some(job) = jobs.queue().take(&args.execution_id).await? else {
                bail!("no pending continuation for execution {}", args.execution_id);
            };
            info!(
                execution_id = %job.execution_id,
                attempt = job.attempt,
                "resuming from continuation job"
            );
            (ExecutionRequest::from_job(&job), true)
        }
        None => {
            let prompt = read_prompt(prompt)?;
            let project_id = project_id.unwrap_or_else(|| default_project_id(&project));
            let mut request = ExecutionRequest::new(project_id, user, prompt);
            if let Some(id) = execution_id {
                request = request.with_execution_id(id);
            }
            (request, false)
        }
    };
    let files = load_project_files(&project, &state_dir)?;
    debug!(files = files.len(), "loaded project files");
    let request = request.with_files(files);

    let mut event_processor: Box<dyn EventProcessor> = if json_mode {
        Box::new(EventProcessorWithJsonOutput::new())
    } else {
        Box::new(EventProcessorWithHumanOutput::new())
    };
    event_processor.print_config_summary(
        &config,
        &RunSummary {
            execution_id: request.execution_id.as_deref(),
            project: &project,
            prompt: &request.request,
            resumed,
        },
    );

    let backend = Arc::new(
        KvFileBackend::new(Arc::clone(&kv), request.project_id.clone()).with_seed_root(&project),
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<LoopEvent>();
    let cancel = CancellationToken::new();
    let driver = ExecutionDriver::new(config, Arc::new(provider), kv, backend)
        .with_mirror(Arc::new(DirMirror::new(&project)))
        .with_jobs(jobs)
        .with_outbox(Outbox::new(tx))
        .with_cancel(cancel.clone());

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Keyboard interrupt");
            cancel.cancel();
        }
    });

    let run = driver.run(request);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            Some(event) = rx.recv() => event_processor.process_event(&event),
        }
    };
    interrupt.abort();
    while let Ok(event) = rx.try_recv() {
        event_processor.process_event(&event);
    }
    let outcome = outcome.context("execution could not be started")?;

    info!(
        execution_id = %outcome.execution_id,
        status = ?outcome.status,
        iterations = outcome.iterations,
        "execution hop finished"
    );
    event_processor.process_outcome(&outcome);
    handle_last_message(Some(&outcome.response), last_message_file.as_deref());
    Ok(exit_code(&outcome))
}

fn read_prompt(prompt_arg: Option<String>) -> anyhow::Result<String> {
    match prompt_arg {
        Some(p) if p != "-" => Ok(p),
        // Either `-` was passed or no positional arg.
        maybe_dash => {
            let force_stdin = matches!(maybe_dash.as_deref(), Some("-"));
            if std::io::stdin().is_terminal() && !force_stdin {
                bail!(
                    "No prompt provided. Either specify one as an argument or pipe the prompt into stdin."
                );
            }
            if !force_stdin {
                eprintln!("Reading prompt from stdin...");
            }
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read prompt from stdin")?;
            if buffer.trim().is_empty() {
                bail!("No prompt provided via stdin.");
            }
            Ok(buffer)
        }
    }
}

fn default_project_id(project: &Path) -> String {
    project
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Every readable text file under `root`, keyed by its `/`-separated
/// relative path. Hidden entries and the state directory are skipped.
fn load_project_files(
    root: &Path,
    state_dir: &Path,
) -> anyhow::Result<Vec<(FileRef, Option<String>)>> {
    let state_dir: PathBuf = state_dir
        .canonicalize()
        .unwrap_or_else(|_| state_dir.to_path_buf());
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || (!is_hidden(entry) && entry.path() != state_dir)
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        match std::fs::read_to_string(entry.path()) {
            Ok(content) => files.push((FileRef::from_path(path), Some(content))),
            Err(err) => debug!(%path, "skipping unreadable file: {err}"),
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_project_walk_skips_hidden_and_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("sections")).unwrap();
        std::fs::create_dir_all(root.join(".forge")).unwrap();
        std::fs::create_dir_all(root.join("state")).unwrap();
        std::fs::write(root.join("sections/header.liquid"), "<header></header>").unwrap();
        std::fs::write(root.join(".forge/record.json"), "{}").unwrap();
        std::fs::write(root.join("state/job.json"), "{}").unwrap();
        std::fs::write(root.join("logo.png"), [0xff_u8, 0xfe, 0x00]).unwrap();

        let files = load_project_files(&root, &root.join("state")).unwrap();

        let paths: Vec<&str> = files.iter().map(|(file, _)| file.path.as_str()).collect();
        assert_eq!(paths, vec!["sections/header.liquid"]);
        assert_eq!(files[0].1.as_deref(), Some("<header></header>"));
    }

    #[test]
    fn test_project_id_defaults_to_directory_name() {
        assert_eq!(default_project_id(Path::new("/themes/dawn")), "dawn");
    }
}
