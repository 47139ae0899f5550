//! The agent loop: plan, generate, execute, validate, retry.
//!
//! One run is strictly sequential and owns at most one live candidate. Every
//! attempt, whether it failed in synthesis or in validation, consumes one unit
//! of the attempt budget and is appended to the history the next prompt is
//! built from.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::agents::synthesizer::{Synthesizer, SynthesizerSettings};
use crate::cancel::CancelToken;
use crate::core::state::{LoopState, Phase, Terminal, after_failure};
use crate::core::types::{
    AttemptFailure, AttemptRecord, CandidateArtifact, ExecutionOutcome, Verdict,
};
use crate::core::validator::validate_outcome;
use crate::io::artifact::persist_parser;
use crate::io::attempt_log::{
    AttemptMeta, AttemptPaths, AttemptSummary, AttemptWriteRequest, RunPaths, RunSummary,
    new_run_id, write_attempt, write_summary,
};
use crate::io::config::{AgentConfig, PreviewConfig};
use crate::io::generator::Generator;
use crate::io::preview::document_preview;
use crate::io::reference::load_reference;
use crate::io::sandbox::{Sandbox, SandboxRequest};
use crate::io::target::Target;

/// Settings for one run, derived from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_attempts: u32,
    pub max_cell_mismatches: usize,
    pub parsers_dir: PathBuf,
    pub state_dir: PathBuf,
    pub extension: String,
    pub synthesizer: SynthesizerSettings,
    pub preview: PreviewConfig,
}

impl RunSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_cell_mismatches: config.max_cell_mismatches,
            parsers_dir: config.parsers_dir.clone(),
            state_dir: config.state_dir.clone(),
            extension: config.parser.extension.clone(),
            synthesizer: SynthesizerSettings::from_config(config),
            preview: config.preview.clone(),
        }
    }
}

pub struct RunRequest<'a> {
    pub target: &'a Target,
    pub settings: &'a RunSettings,
    pub cancel: &'a CancelToken,
}

/// Progress notifications, in order.
#[derive(Debug)]
pub enum AgentEvent<'a> {
    /// The loop entered `phase` while working on `attempt` (0 while planning).
    Phase {
        target_id: &'a str,
        attempt: u32,
        phase: Phase,
    },
    /// An attempt reached its verdict.
    AttemptFinished {
        target_id: &'a str,
        record: &'a AttemptRecord,
        max_attempts: u32,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// `attempt` passed; its source was persisted at `parser_path`.
    Success { attempt: u32, parser_path: PathBuf },
    /// The attempt ceiling was reached; carries the last failure.
    Exhausted {
        attempts: u32,
        last_failure: AttemptFailure,
    },
    /// Cancelled between attempts.
    Cancelled { attempts: u32 },
}

impl RunOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RunOutcome::Success { .. } => "success",
            RunOutcome::Exhausted { .. } => "exhausted",
            RunOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// Final result of a run with its full attempt history.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub target_id: String,
    pub run_dir: PathBuf,
    pub attempts: Vec<AttemptRecord>,
    pub outcome: RunOutcome,
}

/// Bookkeeping for the attempt in flight.
struct InFlight {
    paths: AttemptPaths,
    started: Instant,
    started_at: String,
    dropped_sections: Vec<String>,
    duplicate_of: Option<u32>,
}

/// Run the agent loop for one resolved target.
///
/// Per-attempt failures become feedback; an `Err` means the run could not
/// proceed at all (unreadable reference, sandbox or audit-log failure).
#[instrument(skip_all, fields(target = %request.target.id))]
pub fn run_agent<G, S>(
    generator: &G,
    sandbox: &S,
    request: &RunRequest<'_>,
    observer: &mut dyn FnMut(&AgentEvent<'_>),
) -> Result<RunReport>
where
    G: Generator + ?Sized,
    S: Sandbox + ?Sized,
{
    let target = request.target;
    let settings = request.settings;
    if settings.max_attempts == 0 {
        bail!("max_attempts must be > 0");
    }

    let run_id = new_run_id(&target.id);
    let run_paths = RunPaths::new(&settings.state_dir, &run_id);
    let run_started_at = Utc::now().to_rfc3339();
    info!(run_id = %run_id, max_attempts = settings.max_attempts, "starting run");

    let reference = load_reference(&target.reference_path)
        .with_context(|| format!("load reference for target {}", target.id))?;

    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut synthesizer: Option<Synthesizer<'_, G>> = None;
    let mut in_flight: Option<InFlight> = None;
    let mut state = LoopState::Planning;

    let terminal = loop {
        let attempt = match &state {
            LoopState::Planning => 0,
            LoopState::Generating => history.len() as u32 + 1,
            LoopState::Executing(candidate) | LoopState::Validating(candidate, _) => {
                candidate.attempt
            }
            LoopState::Retrying(record) => record.attempt,
            LoopState::Done(_) => history.len() as u32,
        };
        observer(&AgentEvent::Phase {
            target_id: &target.id,
            attempt,
            phase: state.phase(),
        });
        debug!(phase = state.phase().as_str(), attempt, "loop transition");

        state = match state {
            LoopState::Planning => {
                let preview = document_preview(&target.sample_path, &settings.preview);
                synthesizer = Some(Synthesizer::plan(
                    generator,
                    settings.synthesizer.clone(),
                    target,
                    &reference,
                    preview,
                ));
                LoopState::Generating
            }
            LoopState::Generating => {
                if request.cancel.is_cancelled() {
                    info!(attempts = history.len(), "run cancelled");
                    LoopState::Done(Terminal::Cancelled)
                } else {
                    let synthesizer = synthesizer
                        .as_ref()
                        .context("generating before planning")?;
                    let paths = run_paths.attempt(attempt, &settings.extension);
                    paths.create()?;
                    let started = Instant::now();
                    let started_at = Utc::now().to_rfc3339();
                    let synthesis = synthesizer.synthesize(attempt, &history, &paths)?;
                    let flight = InFlight {
                        paths,
                        started,
                        started_at,
                        dropped_sections: synthesis.dropped_sections,
                        duplicate_of: synthesis.duplicate_of,
                    };
                    match synthesis.candidate {
                        Ok(candidate) => {
                            in_flight = Some(flight);
                            LoopState::Executing(candidate)
                        }
                        Err(failure) => {
                            let record = AttemptRecord {
                                attempt,
                                candidate: None,
                                verdict: Verdict::Fail {
                                    failure: AttemptFailure::Synthesis {
                                        message: failure.message,
                                    },
                                },
                            };
                            finish_attempt(&run_id, target, &flight, &record, None)?;
                            observer(&AgentEvent::AttemptFinished {
                                target_id: &target.id,
                                record: &record,
                                max_attempts: settings.max_attempts,
                            });
                            LoopState::Retrying(record)
                        }
                    }
                }
            }
            LoopState::Executing(candidate) => {
                let flight = in_flight.as_ref().context("executing without an attempt")?;
                let outcome = sandbox
                    .execute(&SandboxRequest {
                        candidate: &candidate,
                        document: &target.sample_path,
                        log_path: Some(&flight.paths.sandbox_log_path),
                        cancel: Some(request.cancel),
                    })
                    .with_context(|| format!("execute attempt {}", candidate.attempt))?;
                LoopState::Validating(candidate, outcome)
            }
            LoopState::Validating(candidate, outcome) => {
                let flight = in_flight.take().context("validating without an attempt")?;
                let verdict = validate_outcome(&outcome, &reference, settings.max_cell_mismatches);
                let record = AttemptRecord {
                    attempt: candidate.attempt,
                    candidate: Some(candidate),
                    verdict,
                };
                finish_attempt(&run_id, target, &flight, &record, Some(&outcome))?;
                observer(&AgentEvent::AttemptFinished {
                    target_id: &target.id,
                    record: &record,
                    max_attempts: settings.max_attempts,
                });
                if record.verdict.is_pass()
                    && let Some(candidate) = record.candidate.clone()
                {
                    history.push(record);
                    LoopState::Done(Terminal::Success(candidate))
                } else {
                    LoopState::Retrying(record)
                }
            }
            LoopState::Retrying(record) => {
                history.push(record);
                after_failure(history.len() as u32, settings.max_attempts)
            }
            LoopState::Done(terminal) => break terminal,
        };
    };

    let outcome = conclude(terminal, &history, target, settings)?;
    let summary = RunSummary {
        run_id: run_id.clone(),
        target_id: target.id.clone(),
        outcome: outcome.kind().to_string(),
        parser_path: match &outcome {
            RunOutcome::Success { parser_path, .. } => Some(parser_path.clone()),
            _ => None,
        },
        last_failure: match &outcome {
            RunOutcome::Exhausted { last_failure, .. } => Some(last_failure.clone()),
            _ => None,
        },
        attempts: history
            .iter()
            .map(|record| AttemptSummary {
                attempt: record.attempt,
                verdict: verdict_kind(&record.verdict).to_string(),
                fingerprint: record.candidate.as_ref().map(|c| c.fingerprint.clone()),
            })
            .collect(),
        started_at: run_started_at,
        ended_at: Utc::now().to_rfc3339(),
    };
    write_summary(&run_paths, &summary)?;
    info!(outcome = outcome.kind(), attempts = history.len(), "run finished");

    Ok(RunReport {
        run_id,
        target_id: target.id.clone(),
        run_dir: run_paths.dir,
        attempts: history,
        outcome,
    })
}

fn conclude(
    terminal: Terminal,
    history: &[AttemptRecord],
    target: &Target,
    settings: &RunSettings,
) -> Result<RunOutcome> {
    let attempts = history.len() as u32;
    Ok(match terminal {
        Terminal::Success(CandidateArtifact {
            attempt, source, ..
        }) => {
            let parser_path =
                persist_parser(&settings.parsers_dir, &target.id, &settings.extension, &source)?;
            RunOutcome::Success {
                attempt,
                parser_path,
            }
        }
        Terminal::Exhausted => {
            let last_failure = history
                .last()
                .and_then(|record| record.verdict.failure())
                .cloned()
                .context("attempts exhausted without a recorded failure")?;
            warn!(attempts, kind = last_failure.kind(), "attempts exhausted");
            RunOutcome::Exhausted {
                attempts,
                last_failure,
            }
        }
        Terminal::Cancelled => RunOutcome::Cancelled { attempts },
    })
}

fn verdict_kind(verdict: &Verdict) -> &'static str {
    match verdict.failure() {
        None => "pass",
        Some(failure) => failure.kind(),
    }
}

fn finish_attempt(
    run_id: &str,
    target: &Target,
    flight: &InFlight,
    record: &AttemptRecord,
    outcome: Option<&ExecutionOutcome>,
) -> Result<()> {
    let meta = AttemptMeta {
        run_id: run_id.to_string(),
        target_id: target.id.clone(),
        attempt: record.attempt,
        fingerprint: record.candidate.as_ref().map(|c| c.fingerprint.clone()),
        provenance: record.candidate.as_ref().map(|c| c.provenance),
        duplicate_of: flight.duplicate_of,
        verdict: verdict_kind(&record.verdict).to_string(),
        dropped_sections: flight.dropped_sections.clone(),
        started_at: flight.started_at.clone(),
        ended_at: Utc::now().to_rfc3339(),
        duration_ms: u64::try_from(flight.started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    write_attempt(&AttemptWriteRequest {
        paths: &flight.paths,
        candidate: record.candidate.as_ref(),
        outcome,
        verdict: &record.verdict,
        meta: &meta,
    })?;
    info!(
        attempt = record.attempt,
        verdict = meta.verdict,
        "attempt finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::{CellValue, Provenance};
    use crate::io::target::TargetResolver;
    use crate::test_support::{
        STATEMENT_CSV, ScriptedGenerator, ScriptedSandbox, statement_table, write_target,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        target: Target,
        settings: RunSettings,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        write_target(&data_dir, "icici", STATEMENT_CSV);
        let target = TargetResolver::new(&data_dir, "result.csv", Vec::new())
            .resolve("icici")
            .expect("resolve");
        let mut config = AgentConfig {
            max_attempts,
            parsers_dir: temp.path().join("custom_parsers"),
            state_dir: temp.path().join(".parsegen"),
            ..AgentConfig::default()
        };
        config.generator.timeout_secs = 5;
        let settings = RunSettings::from_config(&config);
        Fixture {
            _temp: temp,
            target,
            settings,
        }
    }

    fn run(
        fixture: &Fixture,
        generator: &ScriptedGenerator,
        sandbox: &ScriptedSandbox,
        cancel: &CancelToken,
    ) -> (RunReport, Vec<String>) {
        let mut events = Vec::new();
        let report = run_agent(
            generator,
            sandbox,
            &RunRequest {
                target: &fixture.target,
                settings: &fixture.settings,
                cancel,
            },
            &mut |event| match event {
                AgentEvent::Phase { phase, .. } => events.push(phase.as_str().to_string()),
                AgentEvent::AttemptFinished { record, .. } => {
                    events.push(format!("finished:{}", record.attempt));
                }
            },
        )
        .expect("run agent");
        (report, events)
    }

    fn success() -> ExecutionOutcome {
        ExecutionOutcome::Success {
            result: statement_table(),
        }
    }

    fn reordered() -> ExecutionOutcome {
        let mut table = statement_table();
        table.columns.swap(1, 2);
        for row in &mut table.rows {
            row.swap(1, 2);
        }
        ExecutionOutcome::Success { result: table }
    }

    #[test]
    fn first_passing_candidate_ends_the_run() {
        let fixture = fixture(3);
        let generator = ScriptedGenerator::repeating("def parse(p):\n    return 1\n", 3);
        let sandbox = ScriptedSandbox::new(vec![success()]);

        let (report, events) = run(&fixture, &generator, &sandbox, &CancelToken::new());

        assert_eq!(generator.calls(), 1);
        let RunOutcome::Success {
            attempt,
            parser_path,
        } = &report.outcome
        else {
            panic!("unexpected outcome {:?}", report.outcome);
        };
        assert_eq!(*attempt, 1);
        assert_eq!(
            fs::read_to_string(parser_path).expect("read parser"),
            "def parse(p):\n    return 1\n"
        );
        assert!(parser_path.ends_with("custom_parsers/icici_parser.py"));
        assert_eq!(
            events,
            vec![
                "planning",
                "generating",
                "executing",
                "validating",
                "finished:1",
                "done"
            ]
        );
        assert!(report.run_dir.join("summary.json").is_file());
        assert!(report.run_dir.join("1").join("verdict.json").is_file());
    }

    #[test]
    fn always_failing_run_stops_at_the_ceiling() {
        let fixture = fixture(3);
        let generator = ScriptedGenerator::repeating("x = 1\n", 10);
        let sandbox = ScriptedSandbox::new(vec![reordered(), reordered(), reordered(), success()]);

        let (report, _) = run(&fixture, &generator, &sandbox, &CancelToken::new());

        assert_eq!(generator.calls(), 3);
        assert_eq!(report.attempts.len(), 3);
        match &report.outcome {
            RunOutcome::Exhausted {
                attempts,
                last_failure,
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last_failure.kind(), "mismatch");
                assert!(last_failure.to_string().contains("column order mismatch"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!fixture.settings.parsers_dir.join("icici_parser.py").exists());
    }

    #[test]
    fn synthesis_failures_consume_attempts() {
        let fixture = fixture(3);
        let generator = ScriptedGenerator::new(vec![
            Err("generator unavailable".to_string()),
            Err("generator unavailable".to_string()),
            Err("generator unavailable".to_string()),
        ]);
        let sandbox = ScriptedSandbox::new(Vec::new());

        let (report, _) = run(&fixture, &generator, &sandbox, &CancelToken::new());

        assert_eq!(generator.calls(), 3);
        assert!(sandbox.sources().is_empty());
        match &report.outcome {
            RunOutcome::Exhausted { last_failure, .. } => {
                assert_eq!(last_failure.kind(), "synthesis_failure");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(report.attempts.iter().all(|r| r.candidate.is_none()));
    }

    #[test]
    fn each_prompt_contains_the_previous_failure_verbatim() {
        let fixture = fixture(3);
        let generator = ScriptedGenerator::new(vec![
            Ok("a = 1\n".to_string()),
            Ok("a = 2\n".to_string()),
            Ok("a = 3\n".to_string()),
        ]);
        let sandbox = ScriptedSandbox::new(vec![
            ExecutionOutcome::RuntimeFailure {
                message: "ValueError: could not convert string to float: '1,200.00'".to_string(),
                location: Some("candidate.py:7".to_string()),
            },
            reordered(),
            success(),
        ]);

        let (report, _) = run(&fixture, &generator, &sandbox, &CancelToken::new());

        assert!(matches!(report.outcome, RunOutcome::Success { attempt: 3, .. }));
        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 3);
        for k in 0..2 {
            let failure = report.attempts[k].verdict.failure().expect("failure");
            assert!(
                prompts[k + 1].contains(&failure.to_string()),
                "prompt {} is missing the failure of attempt {}",
                k + 2,
                k + 1
            );
        }
        assert_eq!(
            report.attempts[1].candidate.as_ref().map(|c| c.provenance),
            Some(Provenance::Feedback { from_attempt: 1 })
        );
    }

    #[test]
    fn runtime_failure_is_retried_not_fatal() {
        let fixture = fixture(2);
        let generator = ScriptedGenerator::repeating("a = 1\n", 2);
        let sandbox = ScriptedSandbox::new(vec![
            ExecutionOutcome::runtime("ZeroDivisionError: division by zero"),
            success(),
        ]);

        let (report, events) = run(&fixture, &generator, &sandbox, &CancelToken::new());

        assert!(matches!(report.outcome, RunOutcome::Success { attempt: 2, .. }));
        assert_eq!(
            report.attempts[0].verdict.failure().map(|f| f.kind()),
            Some("runtime_failure")
        );
        assert!(events.contains(&"retrying".to_string()));
    }

    #[test]
    fn cancelled_token_stops_before_generating() {
        let fixture = fixture(3);
        let generator = ScriptedGenerator::repeating("a = 1\n", 3);
        let sandbox = ScriptedSandbox::new(Vec::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let (report, _) = run(&fixture, &generator, &sandbox, &cancel);

        assert_eq!(report.outcome, RunOutcome::Cancelled { attempts: 0 });
        assert_eq!(generator.calls(), 0);
    }

    #[test]
    fn mismatch_reports_the_differing_cell() {
        let fixture = fixture(1);
        let generator = ScriptedGenerator::repeating("a = 1\n", 1);
        let mut table = statement_table();
        table.rows[1][2] = CellValue::Number(2500.0);
        let sandbox = ScriptedSandbox::new(vec![ExecutionOutcome::Success { result: table }]);

        let (report, _) = run(&fixture, &generator, &sandbox, &CancelToken::new());

        let RunOutcome::Exhausted { last_failure, .. } = &report.outcome else {
            panic!("unexpected outcome {:?}", report.outcome);
        };
        let text = last_failure.to_string();
        assert!(text.contains("amount"), "{text}");
        assert!(text.contains("2500.5"), "{text}");
    }

    #[test]
    fn missing_reference_is_fatal() {
        let fixture = fixture(3);
        fs::remove_file(&fixture.target.reference_path).expect("remove reference");
        let generator = ScriptedGenerator::repeating("a = 1\n", 3);
        let sandbox = ScriptedSandbox::new(Vec::new());

        let result = run_agent(
            &generator,
            &sandbox,
            &RunRequest {
                target: &fixture.target,
                settings: &fixture.settings,
                cancel: &CancelToken::new(),
            },
            &mut |_| {},
        );
        assert!(result.is_err());
        assert_eq!(generator.calls(), 0);
    }
}
