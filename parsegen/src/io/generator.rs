//! Code-generation boundary.
//!
//! The [`Generator`] trait decouples the synthesizer from the actual model
//! backend (by default `codex exec`). Tests use scripted generators that
//! return predetermined replies without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{
    CommandOutput, command_from_template, run_command_with_timeout, template_uses,
};

/// Parameters for one generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Working directory for the generator process.
    pub workdir: PathBuf,
    /// Prompt text to feed to the model.
    pub prompt: String,
    /// Path where the generator writes its final reply (`{output}`).
    pub response_path: PathBuf,
    /// Path to write generator stdout/stderr log.
    pub log_path: PathBuf,
    /// Maximum time to wait for the generator to complete.
    pub timeout: Duration,
    /// Truncate generator output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over code-generation backends.
pub trait Generator: Sync {
    /// Produce a raw reply for `request.prompt`.
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

/// Generator that runs a configured command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        info!(
            workdir = %request.workdir.display(),
            program = ?self.command.first(),
            "starting generator"
        );

        if let Some(parent) = request.response_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create response dir {}", parent.display()))?;
        }
        let reads_file = template_uses(&self.command, "output");
        let mut cmd = command_from_template(
            &self.command,
            &[
                ("output", request.response_path.display().to_string()),
                ("workdir", request.workdir.display().to_string()),
            ],
        )?;
        cmd.current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            None,
        )
        .context("run generator")?;

        write_generator_log(&request.log_path, &output, request.output_limit_bytes)?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "generator timed out"
            );
            return Err(anyhow!("generator timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}: {}",
                output.status.code(),
                last_line(&output.stderr_lossy()).unwrap_or("no stderr")
            ));
        }

        let reply = if reads_file {
            read_response(&request.response_path)?
        } else {
            output.stdout_lossy()
        };
        if reply.trim().is_empty() {
            return Err(anyhow!("generator returned an empty reply"));
        }
        debug!(bytes = reply.len(), "generator completed successfully");
        Ok(reply)
    }
}

fn read_response(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(anyhow!("missing generator output {}", path.display()));
    }
    fs::read_to_string(path).with_context(|| format!("read generator output {}", path.display()))
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

fn write_generator_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create generator log dir {}", parent.display()))?;
    }
    let mut buf = output.render_log("generator");
    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }
    fs::write(path, buf).with_context(|| format!("write generator log {}", path.display()))
}
