#![forbid(unsafe_code)]

use std::process::ExitCode;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use cp_cli::{Cli, PipelineError, RunConfig, execute, list_fields, logging};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = match cli.into_config(Utc::now) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let config_error = err
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::is_config_error);
            ExitCode::from(if config_error { 2 } else { 1 })
        }
    }
}

fn run(config: RunConfig) -> anyhow::Result<()> {
    match config {
        RunConfig::DryRun { input } => {
            let fields = list_fields(&input)
                .with_context(|| format!("failed to read header of '{}'", input.display()))?;
            println!("Available fields in input CSV:");
            for field in fields {
                println!("  - {field}");
            }
        }
        RunConfig::Aggregate(config) => {
            execute(&config)
                .with_context(|| format!("failed to summarize '{}'", config.input.display()))?;
        }
    }
    Ok(())
}
