#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use forge_exec::Cli;
use forge_exec::run_main;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

const HEADER: &str = "sections/header.liquid";
const HEADER_SOURCE: &str = "<header style=\"color: red\">{{ shop.name }}</header>";

fn project() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("sections")).unwrap();
    std::fs::write(dir.path().join(HEADER), HEADER_SOURCE).unwrap();
    dir
}

fn write_fixture(dir: &Path, name: &str, script: Value) -> String {
    let path = dir.join(name);
    std::fs::write(&path, script.to_string()).unwrap();
    path.display().to_string()
}

fn edit_turns() -> Vec<Value> {
    vec![
        json!({"tool_calls": [{"name": "read_file", "input": {"path": HEADER}}]}),
        json!({"tool_calls": [{
            "name": "edit_file",
            "input": {"path": HEADER, "old_text": "color: red", "new_text": "color: blue"}
        }]}),
    ]
}

fn same_code(left: ExitCode, right: ExitCode) -> bool {
    format!("{left:?}") == format!("{right:?}")
}

async fn run(args: &[&str]) -> ExitCode {
    let mut argv = vec!["forge-exec"];
    argv.extend_from_slice(args);
    run_main(Cli::try_parse_from(argv).unwrap()).await.unwrap()
}

#[tokio::test]
async fn test_run_writes_edit_back_to_project() {
    let project = project();
    let scratch = tempfile::tempdir().unwrap();
    let mut turns = edit_turns();
    turns.push(json!({"text": "The header color is now blue."}));
    let fixture = write_fixture(scratch.path(), "turns.json", json!({"turns": turns}));
    let last_message = scratch.path().join("last.txt");
    let project_dir = project.path().display().to_string();
    let last_message_arg = last_message.display().to_string();

    let code = run(&[
        "--project",
        &project_dir,
        "--fixture",
        &fixture,
        "--json",
        "--output-last-message",
        &last_message_arg,
        "make the header blue",
    ])
    .await;

    assert!(same_code(code, ExitCode::SUCCESS));
    assert_eq!(
        std::fs::read_to_string(project.path().join(HEADER)).unwrap(),
        "<header style=\"color: blue\">{{ shop.name }}</header>"
    );
    assert!(
        std::fs::read_to_string(&last_message)
            .unwrap()
            .contains("The header color is now blue.")
    );
}

#[tokio::test]
async fn test_rejected_changes_restore_project_and_fail() {
    let project = project();
    let scratch = tempfile::tempdir().unwrap();
    let fixture = write_fixture(
        scratch.path(),
        "turns.json",
        json!({"turns": [
            {"tool_calls": [{"name": "read_file", "input": {"path": HEADER}}]},
            {"tool_calls": [{"name": "edit_file", "input": {
                "path": HEADER,
                "old_text": "{{ shop.name }}</header>",
                "new_text": "{{ shop.name }\n{% if shop %}</header>"
            }}]},
            {"text": "Done."}
        ]}),
    );
    let project_dir = project.path().display().to_string();

    let code = run(&["--project", &project_dir, "--fixture", &fixture, "break the header"]).await;

    assert!(same_code(code, ExitCode::FAILURE));
    assert_eq!(
        std::fs::read_to_string(project.path().join(HEADER)).unwrap(),
        HEADER_SOURCE
    );
}

#[tokio::test]
async fn test_checkpointed_run_continues_with_resume() {
    let project = project();
    let scratch = tempfile::tempdir().unwrap();
    let mut turns = edit_turns();
    turns.push(json!({"delay_ms": 900, "tool_calls": [{"name": "list_files", "input": {}}]}));
    let first = write_fixture(scratch.path(), "first.json", json!({"turns": turns}));
    let second = write_fixture(
        scratch.path(),
        "second.json",
        json!({"turns": [{"text": "The header color is now blue."}]}),
    );
    let project_dir = project.path().display().to_string();

    let code = run(&[
        "--project",
        &project_dir,
        "--fixture",
        &first,
        "--wall-clock-secs",
        "1",
        "--execution-id",
        "exec-1",
        "make the header blue",
    ])
    .await;
    assert!(same_code(code, ExitCode::SUCCESS));
    // The edit is already visible on disk while the execution is pending.
    assert!(
        std::fs::read_to_string(project.path().join(HEADER))
            .unwrap()
            .contains("color: blue")
    );

    let code = run(&["resume", "exec-1", "--project", &project_dir, "--fixture", &second]).await;
    assert!(same_code(code, ExitCode::SUCCESS));
    assert!(
        std::fs::read_to_string(project.path().join(HEADER))
            .unwrap()
            .contains("color: blue")
    );

    // The continuation job was consumed.
    let again = Cli::try_parse_from([
        "forge-exec",
        "resume",
        "exec-1",
        "--project",
        &project_dir,
        "--fixture",
        &second,
    ])
    .unwrap();
    assert!(run_main(again).await.is_err());
}
