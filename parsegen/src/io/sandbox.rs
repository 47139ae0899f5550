//! Sandboxed execution of candidate parsers.
//!
//! Every call gets a fresh temporary directory and a separate child process,
//! so nothing defined by one attempt is visible to the next. The directory is
//! removed when the call returns, including on timeout and cancellation.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::contract::{
    CONTRACT_VIOLATION_EXIT_CODE, LOAD_FAILURE_EXIT_CODE, parse_tabular_result,
};
use crate::core::types::{CandidateArtifact, ExecutionOutcome};
use crate::io::config::AgentConfig;
use crate::io::process::{
    CommandOutput, command_from_template, run_command_with_timeout, template_uses,
};

/// Built-in driver that loads a Python candidate and prints its table.
pub const PYTHON_DRIVER: &str = include_str!("drivers/python_driver.py");

const DRIVER_FILE: &str = "_parsegen_driver.py";

/// Number of stderr lines kept in a syntax failure message.
const SYNTAX_TAIL_LINES: usize = 20;

static PYTHON_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("valid regex"));
static SHELL_LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\S+?):(?: line)? (\d+):").expect("valid regex"));

/// One execution request.
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub candidate: &'a CandidateArtifact,
    pub document: &'a Path,
    /// Where to write the combined check/run log, if anywhere.
    pub log_path: Option<&'a Path>,
    pub cancel: Option<&'a CancelToken>,
}

/// Executes a candidate against a document and classifies the result.
///
/// An `Err` is an infrastructure failure (no temp dir, interpreter cannot be
/// spawned); anything the candidate does wrong is an `ExecutionOutcome`.
pub trait Sandbox: Sync {
    fn execute(&self, request: &SandboxRequest<'_>) -> Result<ExecutionOutcome>;
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub check: Option<Vec<String>>,
    pub run: Vec<String>,
    pub driver: Option<PathBuf>,
    pub extension: String,
    pub entry_point: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl SandboxSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            check: config.sandbox.check.clone(),
            run: config.sandbox.run.clone(),
            driver: config.sandbox.driver.clone(),
            extension: config.parser.extension.clone(),
            entry_point: config.parser.entry_point.clone(),
            timeout: Duration::from_secs(config.sandbox.timeout_secs),
            output_limit_bytes: config.sandbox.output_limit_bytes,
        }
    }
}

/// Child-process sandbox.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    settings: SandboxSettings,
}

impl ProcessSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    fn run_step(
        &self,
        template: &[String],
        vars: &[(&str, String)],
        workdir: &Path,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandOutput> {
        let mut cmd: Command = command_from_template(template, vars)?;
        cmd.current_dir(workdir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8");
        let remaining = deadline.saturating_duration_since(Instant::now());
        run_command_with_timeout(
            cmd,
            None,
            remaining.max(Duration::from_millis(1)),
            self.settings.output_limit_bytes,
            cancel,
        )
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(attempt = request.candidate.attempt))]
    fn execute(&self, request: &SandboxRequest<'_>) -> Result<ExecutionOutcome> {
        let dir = tempfile::Builder::new()
            .prefix("parsegen-attempt-")
            .tempdir()
            .context("create sandbox directory")?;
        let workdir = dir.path().to_path_buf();

        let source_name = format!("candidate.{}", self.settings.extension);
        let source_path = workdir.join(&source_name);
        fs::write(&source_path, &request.candidate.source)
            .with_context(|| format!("write candidate {}", source_path.display()))?;

        let driver_path = match &self.settings.driver {
            Some(path) => path.clone(),
            None => {
                let path = workdir.join(DRIVER_FILE);
                if template_uses(&self.settings.run, "driver") {
                    fs::write(&path, PYTHON_DRIVER)
                        .with_context(|| format!("write driver {}", path.display()))?;
                }
                path
            }
        };

        let vars = [
            ("source", source_path.display().to_string()),
            ("document", request.document.display().to_string()),
            ("driver", driver_path.display().to_string()),
            ("workdir", workdir.display().to_string()),
            ("entry_point", self.settings.entry_point.clone()),
        ];
        let deadline = Instant::now() + self.settings.timeout;
        let mut log = String::new();

        let mut outcome = None;
        if let Some(check) = &self.settings.check {
            debug!("running check step");
            let output = self.run_step(check, &vars, &workdir, deadline, request.cancel)?;
            log.push_str(&output.render_log("check"));
            log.push('\n');
            if output.cancelled {
                outcome = Some(ExecutionOutcome::runtime("cancelled"));
            } else if output.timed_out {
                outcome = Some(ExecutionOutcome::runtime("timeout"));
            } else if !output.status.success() {
                outcome = Some(ExecutionOutcome::SyntaxFailure {
                    message: scrub(&failure_text(&output), &workdir),
                });
            }
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                debug!("running candidate");
                let output =
                    self.run_step(&self.settings.run, &vars, &workdir, deadline, request.cancel)?;
                log.push_str(&output.render_log("run"));
                let outcome = classify(&output, &source_name)?;
                match outcome {
                    ExecutionOutcome::Success { .. } => outcome,
                    other => scrub_outcome(other, &workdir),
                }
            }
        };

        if let Some(log_path) = request.log_path {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create sandbox log dir {}", parent.display()))?;
            }
            fs::write(log_path, &log)
                .with_context(|| format!("write sandbox log {}", log_path.display()))?;
        }

        dir.close().context("remove sandbox directory")?;
        info!(outcome = outcome.kind(), "candidate executed");
        Ok(outcome)
    }
}

/// Map a finished run to an outcome.
pub fn classify(output: &CommandOutput, source_name: &str) -> Result<ExecutionOutcome> {
    if output.cancelled {
        return Ok(ExecutionOutcome::runtime("cancelled"));
    }
    if output.timed_out {
        warn!("candidate timed out");
        return Ok(ExecutionOutcome::runtime("timeout"));
    }
    let stderr = output.stderr_lossy();
    match output.status.code() {
        Some(0) => {
            if output.stdout_truncated > 0 {
                return Ok(ExecutionOutcome::ContractViolation {
                    reason: format!(
                        "result exceeded the {} byte output limit",
                        output.stdout.len()
                    ),
                });
            }
            Ok(match parse_tabular_result(&output.stdout_lossy())? {
                Ok(result) => ExecutionOutcome::Success { result },
                Err(reason) => ExecutionOutcome::ContractViolation { reason },
            })
        }
        Some(LOAD_FAILURE_EXIT_CODE) => Ok(ExecutionOutcome::SyntaxFailure {
            message: failure_text(output),
        }),
        Some(CONTRACT_VIOLATION_EXIT_CODE) => Ok(ExecutionOutcome::ContractViolation {
            reason: last_line(&stderr)
                .unwrap_or("entry point returned a value that is not a table")
                .to_string(),
        }),
        code => Ok(ExecutionOutcome::RuntimeFailure {
            message: last_line(&stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("exited with status {code:?}")),
            location: find_location(&stderr, source_name),
        }),
    }
}

/// Innermost `file:line` in the candidate itself, from a traceback or shell error.
pub fn find_location(stderr: &str, source_name: &str) -> Option<String> {
    let in_candidate = |path: &str| {
        Path::new(path)
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == source_name)
    };
    let python = PYTHON_FRAME_RE
        .captures_iter(stderr)
        .filter(|caps| in_candidate(&caps[1]))
        .last()
        .map(|caps| format!("{source_name}:{}", &caps[2]));
    python.or_else(|| {
        SHELL_LOCATION_RE
            .captures_iter(stderr)
            .find(|caps| in_candidate(&caps[1]))
            .map(|caps| format!("{source_name}:{}", &caps[2]))
    })
}

fn failure_text(output: &CommandOutput) -> String {
    let stderr = output.stderr_lossy();
    let text = if stderr.trim().is_empty() {
        output.stdout_lossy()
    } else {
        stderr
    };
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(SYNTAX_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.trim().is_empty() {
        format!("exited with status {:?}", output.status.code())
    } else {
        tail
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

/// Strip the throwaway directory from messages so feedback is stable across attempts.
fn scrub(text: &str, workdir: &Path) -> String {
    let prefix = format!("{}/", workdir.display());
    text.replace(&prefix, "")
}

fn scrub_outcome(outcome: ExecutionOutcome, workdir: &Path) -> ExecutionOutcome {
    match outcome {
        ExecutionOutcome::SyntaxFailure { message } => ExecutionOutcome::SyntaxFailure {
            message: scrub(&message, workdir),
        },
        ExecutionOutcome::RuntimeFailure { message, location } => {
            ExecutionOutcome::RuntimeFailure {
                message: scrub(&message, workdir),
                location,
            }
        }
        ExecutionOutcome::ContractViolation { reason } => ExecutionOutcome::ContractViolation {
            reason: scrub(&reason, workdir),
        },
        success @ ExecutionOutcome::Success { .. } => success,
    }
}
