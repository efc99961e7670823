// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A thin driver binary over the `engine` façade (C7). Flag parsing, config-file loading, and
//! process wiring live here precisely because they're the external collaborators the evaluator
//! itself doesn't own: this binary's only job is to build a `BuildOptions`, construct a `Facade`,
//! and call one of its `evaluate_*` entry points.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use engine::{Facade, FacadeError};
use options::BuildOptions;
use task_executor::Executor;

#[derive(Parser)]
#[command(name = "engine-cli", about = "Drives the incremental evaluator façade")]
struct Cli {
    /// Root of the workspace being built.
    #[arg(long, default_value = ".")]
    build_root: PathBuf,

    /// Path to a `pants.toml`-style options file; unset fields take `BuildOptions::default()`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep evaluating independent keys after one fails, instead of stopping at the first error.
    #[arg(long)]
    keep_going: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve target patterns into Package values (§4.7 `evaluate_target_patterns`).
    Evaluate { patterns: Vec<String> },
    /// Build the given actions (§4.7 `execute`).
    Execute { actions: Vec<String> },
    /// Assemble the build-wide configuration (§4.7 `evaluate_configurations`).
    Configure,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    logging::init(level, atty_is_terminal());

    let options = match &cli.config {
        Some(path) => match BuildOptions::from_file(path) {
            Ok(options) => options,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => BuildOptions::default(),
    };
    let options = BuildOptions {
        build_root: cli.build_root,
        keep_going: cli.keep_going || options.keep_going,
        ..options
    };

    let executor = match Executor::new(options.resolved_num_threads_analysis()) {
        Ok(executor) => executor,
        Err(err) => {
            log::error!("Failed to start the executor: {err}");
            return ExitCode::FAILURE;
        }
    };

    let facade = Facade::new(options.clone(), executor.clone());
    let result = executor.block_on(run(&facade, cli.command, options.keep_going));
    let snapshot = facade.metrics();
    log::info!(
        "{} built fresh, {} reused, {} failed",
        snapshot.nodes_built_fresh,
        snapshot.nodes_reused_clean,
        snapshot.nodes_failed,
    );

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(facade: &Facade, command: Command, keep_going: bool) -> Result<(), FacadeError> {
    match command {
        Command::Evaluate { patterns } => {
            let result = facade.evaluate_target_patterns(&patterns, keep_going).await?;
            for (key, value) in result {
                match value {
                    Ok(value) => println!("{key}: {value:?}"),
                    Err(err) => println!("{key}: error: {err}"),
                }
            }
            Ok(())
        }
        Command::Execute { actions } => {
            let result = facade.execute(&actions, keep_going).await?;
            for (key, value) in result {
                match value {
                    Ok(value) => println!("{key}: {value:?}"),
                    Err(err) => println!("{key}: error: {err}"),
                }
            }
            Ok(())
        }
        Command::Configure => {
            let configuration = facade.evaluate_configurations(keep_going).await?;
            println!("{configuration:?}");
            Ok(())
        }
    }
}

fn atty_is_terminal() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}
