//! `parsegen` CLI.
//!
//! Generates a parser for each target under the data directory by looping
//! generate → execute → validate until the parser's output equals the
//! target's reference CSV.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use parsegen::agent::{AgentEvent, RunOutcome, RunReport};
use parsegen::cancel::CancelToken;
use parsegen::core::types::Verdict;
use parsegen::exit_codes;
use parsegen::logging;
use parsegen::run::{
    Resolved, Workspace, check_parser, init_workspace, resolve_target, run_target,
};

#[derive(Parser)]
#[command(
    name = "parsegen",
    version,
    about = "Generate document parsers by iterating against a reference table"
)]
struct Cli {
    /// Workspace root containing `parsegen.toml`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `parsegen.toml` and create the data and parser directories.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Show the sample document, reference file and schema of a target.
    Resolve {
        #[arg(short, long)]
        target: String,
    },
    /// Generate parsers; several targets run in parallel.
    Run {
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,
        /// Override `max_attempts` from the config.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Execute an existing parser against a target and validate its output.
    Check {
        #[arg(short, long)]
        target: String,
        #[arg(short, long)]
        parser: PathBuf,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Resolve { target } => cmd_resolve(&cli.root, &target),
        Command::Run {
            targets,
            max_attempts,
        } => cmd_run(&cli.root, &targets, max_attempts),
        Command::Check { target, parser } => cmd_check(&cli.root, &target, &parser),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let report = init_workspace(root, force)?;
    if report.config_written {
        println!("wrote {}", report.config_path.display());
    } else {
        println!("kept {}", report.config_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_resolve(root: &Path, id: &str) -> Result<i32> {
    let workspace = Workspace::load(root)?;
    let Resolved { target, reference } = resolve_target(&workspace, id)?;
    println!("target: {}", target.id);
    println!("sample: {}", target.sample_path.display());
    println!("reference: {}", target.reference_path.display());
    println!("rows: {}", reference.row_count());
    for column in &reference.columns {
        println!("column: {} ({})", column.name, column.kind.as_str());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, ids: &[String], max_attempts: Option<u32>) -> Result<i32> {
    let workspace = Workspace::load(root)?;
    let settings = workspace.run_settings(max_attempts)?;
    // Unknown targets fail before any run starts.
    for id in ids {
        workspace.resolve(id)?;
    }

    let stdout = Mutex::new(());
    let results: Vec<(String, Result<RunReport>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let workspace = &workspace;
                let settings = &settings;
                let stdout = &stdout;
                scope.spawn(move || {
                    let cancel = CancelToken::new();
                    let result = run_target(workspace, id, settings, &cancel, &mut |event| {
                        if let Some(line) = progress_line(event) {
                            let _guard = stdout.lock();
                            println!("{line}");
                        }
                    });
                    (id.clone(), result)
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(ids)
            .map(|(handle, id)| match handle.join() {
                Ok(result) => result,
                Err(_) => (id.clone(), Err(anyhow::anyhow!("run thread panicked"))),
            })
            .collect()
    });

    let mut code = exit_codes::OK;
    for (id, result) in results {
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                eprintln!("[{id}] {err:#}");
                code = code.max(exit_codes::INVALID);
                continue;
            }
        };
        code = code.max(print_report(&report));
    }
    Ok(code)
}

fn cmd_check(root: &Path, id: &str, parser: &Path) -> Result<i32> {
    let workspace = Workspace::load(root)?;
    let report = check_parser(
        &workspace,
        &workspace.sandbox(),
        id,
        parser,
        &CancelToken::new(),
    )
    .with_context(|| format!("check {}", parser.display()))?;
    match &report.verdict {
        Verdict::Pass => {
            println!("[{}] pass", report.target.id);
            Ok(exit_codes::OK)
        }
        Verdict::Fail { failure } => {
            println!("[{}] fail ({})", report.target.id, failure.kind());
            println!("{failure}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn progress_line(event: &AgentEvent<'_>) -> Option<String> {
    match event {
        AgentEvent::Phase { .. } => None,
        AgentEvent::AttemptFinished {
            target_id,
            record,
            max_attempts,
        } => Some(match record.verdict.failure() {
            None => format!("[{target_id}] attempt {}/{max_attempts}: pass", record.attempt),
            Some(failure) => format!(
                "[{target_id}] attempt {}/{max_attempts}: {}",
                record.attempt,
                failure.kind()
            ),
        }),
    }
}

fn print_report(report: &RunReport) -> i32 {
    let id = &report.target_id;
    match &report.outcome {
        RunOutcome::Success {
            attempt,
            parser_path,
        } => {
            println!(
                "[{id}] parser written to {} (attempt {attempt})",
                parser_path.display()
            );
            println!("[{id}] attempt log: {}", report.run_dir.display());
            exit_codes::OK
        }
        RunOutcome::Exhausted {
            attempts,
            last_failure,
        } => {
            println!("[{id}] no passing parser after {attempts} attempts; last failure:");
            println!("{last_failure}");
            println!("[{id}] attempt log: {}", report.run_dir.display());
            exit_codes::EXHAUSTED
        }
        RunOutcome::Cancelled { attempts } => {
            println!("[{id}] cancelled after {attempts} attempts");
            exit_codes::CANCELLED
        }
    }
}
