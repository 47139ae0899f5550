//! Agent configuration stored in `parsegen.toml` at the working root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// File name of the configuration, relative to the working root.
pub const CONFIG_FILE: &str = "parsegen.toml";

/// Agent configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that drive a Python parser through the built-in driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Attempt ceiling per run (generate/execute/validate cycles).
    pub max_attempts: u32,

    /// Directory holding one sub-directory per target.
    pub data_dir: PathBuf,

    /// Directory receiving the generated parser for each target.
    pub parsers_dir: PathBuf,

    /// Directory for run audit logs.
    pub state_dir: PathBuf,

    /// Reference dataset file name inside each target directory.
    pub reference_file: String,

    /// Allowed sample document extensions (without dot). Empty accepts any file.
    pub sample_extensions: Vec<String>,

    /// Number of expected rows shown to the generator.
    pub sample_rows: usize,

    /// Number of mismatched cells listed in a diff.
    pub max_cell_mismatches: usize,

    /// Maximum bytes for the synthesis prompt before dropping sections.
    pub prompt_budget_bytes: usize,

    pub parser: ParserConfig,
    pub generator: GeneratorConfig,
    pub sandbox: SandboxConfig,
    pub preview: PreviewConfig,
}

/// What the generated module looks like.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParserConfig {
    /// Language name shown in the prompt and used to pick the fenced code block.
    pub language: String,
    /// File extension of the generated module.
    pub extension: String,
    /// Name of the function the driver calls.
    pub entry_point: String,
    /// Return shapes the driver accepts, described for the prompt.
    pub result_hint: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            language: "python".to_string(),
            extension: "py".to_string(),
            entry_point: "parse".to_string(),
            result_hint: "a pandas DataFrame, a dict with `columns` and `rows`, or a list of dicts"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that turns a prompt on stdin into code. `{output}` is replaced
    /// with a file path the command writes its reply to; without it the reply
    /// is read from stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--skip-git-repo-check",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .map(String::from)
            .to_vec(),
            timeout_secs: 5 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Optional compile-only step; a non-zero exit is a syntax failure.
    pub check: Option<Vec<String>>,
    /// Command that runs the candidate and prints its table as JSON.
    /// Placeholders: `{source}`, `{document}`, `{driver}`, `{entry_point}`, `{workdir}`.
    pub run: Vec<String>,
    /// Driver file to use instead of the built-in Python driver.
    pub driver: Option<PathBuf>,
    /// Wall-clock limit for check + run together.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            check: Some(
                ["python3", "-m", "py_compile", "{source}"]
                    .map(String::from)
                    .to_vec(),
            ),
            run: ["python3", "{driver}", "{source}", "{document}", "{entry_point}"]
                .map(String::from)
                .to_vec(),
            driver: None,
            timeout_secs: 60,
            output_limit_bytes: 2_000_000,
        }
    }
}

/// How the sample document is summarized for the prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreviewConfig {
    /// Optional extractor (e.g. `["pdftotext", "-layout", "{document}", "-"]`).
    pub command: Option<Vec<String>>,
    pub limit_bytes: usize,
    pub timeout_secs: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            command: None,
            limit_bytes: 8_000,
            timeout_secs: 30,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            data_dir: PathBuf::from("data"),
            parsers_dir: PathBuf::from("custom_parsers"),
            state_dir: PathBuf::from(".parsegen"),
            reference_file: "result.csv".to_string(),
            sample_extensions: Vec::new(),
            sample_rows: 3,
            max_cell_mismatches: 10,
            prompt_budget_bytes: 60_000,
            parser: ParserConfig::default(),
            generator: GeneratorConfig::default(),
            sandbox: SandboxConfig::default(),
            preview: PreviewConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.reference_file.trim().is_empty() {
            return Err(anyhow!("reference_file must be non-empty"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.parser.extension.trim().is_empty() || self.parser.extension.starts_with('.') {
            return Err(anyhow!("parser.extension must be non-empty and have no leading dot"));
        }
        if self.parser.entry_point.trim().is_empty() {
            return Err(anyhow!("parser.entry_point must be non-empty"));
        }
        validate_command("generator.command", &self.generator.command)?;
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        validate_command("sandbox.run", &self.sandbox.run)?;
        if let Some(check) = &self.sandbox.check {
            validate_command("sandbox.check", check)?;
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if let Some(command) = &self.preview.command {
            validate_command("preview.command", command)?;
        }
        if self.preview.timeout_secs == 0 {
            return Err(anyhow!("preview.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

fn validate_command(label: &str, command: &[String]) -> Result<()> {
    if command.is_empty() || command[0].trim().is_empty() {
        return Err(anyhow!("{label} must be a non-empty array"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
