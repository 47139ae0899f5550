//! Orchestration behind the CLI commands: config, target resolution, runs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::agent::{AgentEvent, RunReport, RunRequest, RunSettings, run_agent};
use crate::agents::synthesizer::fingerprint;
use crate::cancel::CancelToken;
use crate::core::types::{
    CandidateArtifact, ExecutionOutcome, Provenance, ReferenceDataset, Verdict,
};
use crate::core::validator::validate_outcome;
use crate::io::config::{AgentConfig, CONFIG_FILE, load_config, write_config};
use crate::io::generator::CommandGenerator;
use crate::io::reference::load_reference;
use crate::io::sandbox::{ProcessSandbox, Sandbox, SandboxRequest, SandboxSettings};
use crate::io::target::{Target, TargetResolver};

/// Config loaded from `<root>/parsegen.toml` with every directory made
/// relative to `root`.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: AgentConfig,
}

impl Workspace {
    pub fn load(root: &Path) -> Result<Self> {
        let mut config = load_config(&root.join(CONFIG_FILE))?;
        config.data_dir = root.join(&config.data_dir);
        config.parsers_dir = root.join(&config.parsers_dir);
        config.state_dir = root.join(&config.state_dir);
        config.sandbox.driver = config.sandbox.driver.as_ref().map(|path| root.join(path));
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn resolver(&self) -> TargetResolver {
        TargetResolver::new(
            &self.config.data_dir,
            &self.config.reference_file,
            self.config.sample_extensions.clone(),
        )
    }

    pub fn resolve(&self, id: &str) -> Result<Target> {
        Ok(self.resolver().resolve(id)?)
    }

    pub fn sandbox(&self) -> ProcessSandbox {
        ProcessSandbox::new(SandboxSettings::from_config(&self.config))
    }

    pub fn generator(&self) -> CommandGenerator {
        CommandGenerator::new(self.config.generator.command.clone())
    }

    /// Run settings, with `max_attempts` overridden when given.
    pub fn run_settings(&self, max_attempts: Option<u32>) -> Result<RunSettings> {
        let mut settings = RunSettings::from_config(&self.config);
        if let Some(max_attempts) = max_attempts {
            if max_attempts == 0 {
                bail!("--max-attempts must be > 0");
            }
            settings.max_attempts = max_attempts;
        }
        Ok(settings)
    }
}

/// What `init` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub config_written: bool,
}

/// Write the default config (unless present and not forced) and create the
/// data and parser directories.
pub fn init_workspace(root: &Path, force: bool) -> Result<InitReport> {
    let config_path = root.join(CONFIG_FILE);
    let config_written = force || !config_path.exists();
    if config_written {
        write_config(&config_path, &AgentConfig::default())?;
    }
    let workspace = Workspace::load(root)?;
    for dir in [&workspace.config.data_dir, &workspace.config.parsers_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(InitReport {
        config_path,
        config_written,
    })
}

/// A resolved target together with its loaded reference.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub target: Target,
    pub reference: ReferenceDataset,
}

pub fn resolve_target(workspace: &Workspace, id: &str) -> Result<Resolved> {
    let target = workspace.resolve(id)?;
    let reference = load_reference(&target.reference_path)?;
    Ok(Resolved { target, reference })
}

/// Resolve `id` and run the agent with the configured generator and sandbox.
pub fn run_target(
    workspace: &Workspace,
    id: &str,
    settings: &RunSettings,
    cancel: &CancelToken,
    observer: &mut dyn FnMut(&AgentEvent<'_>),
) -> Result<RunReport> {
    let target = workspace.resolve(id)?;
    run_agent(
        &workspace.generator(),
        &workspace.sandbox(),
        &RunRequest {
            target: &target,
            settings,
            cancel,
        },
        observer,
    )
}

/// Result of checking an existing parser.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub target: Target,
    pub outcome: ExecutionOutcome,
    pub verdict: Verdict,
}

/// Execute the parser at `parser_path` against `id`'s sample and validate it.
pub fn check_parser<S: Sandbox + ?Sized>(
    workspace: &Workspace,
    sandbox: &S,
    id: &str,
    parser_path: &Path,
    cancel: &CancelToken,
) -> Result<CheckReport> {
    let Resolved { target, reference } = resolve_target(workspace, id)?;
    let source = fs::read_to_string(parser_path)
        .with_context(|| format!("read parser {}", parser_path.display()))?;
    let candidate = CandidateArtifact {
        attempt: 1,
        fingerprint: fingerprint(&source),
        source,
        provenance: Provenance::Initial,
    };
    let outcome = sandbox.execute(&SandboxRequest {
        candidate: &candidate,
        document: &target.sample_path,
        log_path: None,
        cancel: Some(cancel),
    })?;
    let verdict = validate_outcome(&outcome, &reference, workspace.config.max_cell_mismatches);
    info!(target = %target.id, pass = verdict.is_pass(), "checked parser");
    Ok(CheckReport {
        target,
        outcome,
        verdict,
    })
}
