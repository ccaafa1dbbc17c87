use std::process::ExitCode;

use clap::Parser;
use forge_exec::Cli;
use forge_exec::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    run_main(cli).await
}
