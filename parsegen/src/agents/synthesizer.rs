//! Code synthesizer: prompt from (target, history), reply to candidate.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::extract_code;
use crate::core::types::{
    AttemptRecord, CandidateArtifact, Provenance, ReferenceDataset,
};
use crate::io::attempt_log::{AttemptPaths, write_text};
use crate::io::config::AgentConfig;
use crate::io::generator::{GenerateRequest, Generator};
use crate::io::prompt::{AttemptView, PromptBuilder, PromptInputs, PromptPack};
use crate::io::target::Target;

/// The generator could not produce a usable candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SynthesisFailure {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SynthesizerSettings {
    pub language: String,
    pub entry_point: String,
    pub result_hint: String,
    pub prompt_budget_bytes: usize,
    pub sample_rows: usize,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl SynthesizerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            language: config.parser.language.clone(),
            entry_point: config.parser.entry_point.clone(),
            result_hint: config.parser.result_hint.clone(),
            prompt_budget_bytes: config.prompt_budget_bytes,
            sample_rows: config.sample_rows,
            timeout: Duration::from_secs(config.generator.timeout_secs),
            output_limit_bytes: config.generator.output_limit_bytes,
        }
    }
}

/// Result of one synthesis call.
#[derive(Debug)]
pub struct Synthesis {
    pub candidate: Result<CandidateArtifact, SynthesisFailure>,
    /// Prompt sections dropped to fit the budget.
    pub dropped_sections: Vec<String>,
    /// Earlier attempt whose source is byte-identical to this candidate.
    pub duplicate_of: Option<u32>,
}

/// Synthesizer bound to one target for the duration of a run.
pub struct Synthesizer<'a, G: Generator + ?Sized> {
    generator: &'a G,
    settings: SynthesizerSettings,
    base: PromptInputs,
}

impl<'a, G: Generator + ?Sized> Synthesizer<'a, G> {
    /// Build the fixed part of every prompt for `target`.
    pub fn plan(
        generator: &'a G,
        settings: SynthesizerSettings,
        target: &Target,
        reference: &ReferenceDataset,
        document_preview: Option<String>,
    ) -> Self {
        let base = PromptInputs {
            target_id: target.id.clone(),
            description: target.description.clone(),
            notes: target.notes.clone(),
            document_name: file_name(&target.sample_path),
            language: settings.language.clone(),
            entry_point: settings.entry_point.clone(),
            result_hint: settings.result_hint.clone(),
            columns: reference.columns.clone(),
            row_count: reference.row_count(),
            sample: reference.to_table().head(settings.sample_rows),
            document_preview,
            history: Vec::new(),
            latest: None,
        };
        Self {
            generator,
            settings,
            base,
        }
    }

    /// Prompt for the attempt following `history` (oldest first).
    pub fn build_prompt(&self, history: &[AttemptRecord]) -> Result<PromptPack> {
        let mut views: Vec<AttemptView> = history
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let duplicate_of = record
                    .candidate
                    .as_ref()
                    .and_then(|c| find_duplicate(&history[..index], &c.fingerprint));
                AttemptView::from_record(record, duplicate_of)
            })
            .collect();
        let latest = views.pop();
        let inputs = PromptInputs {
            history: views,
            latest,
            ..self.base.clone()
        };
        PromptBuilder::new(self.settings.prompt_budget_bytes).build(&inputs)
    }

    /// Generate the candidate for `attempt`, writing prompt and reply under `paths`.
    ///
    /// `Err` is reserved for audit-log failures; a generator that fails or
    /// replies without code yields `Ok` with a [`SynthesisFailure`].
    #[instrument(skip_all, fields(attempt = attempt))]
    pub fn synthesize(
        &self,
        attempt: u32,
        history: &[AttemptRecord],
        paths: &AttemptPaths,
    ) -> Result<Synthesis> {
        let prompt = self.build_prompt(history)?;
        write_text(&paths.prompt_path, prompt.render())?;
        debug!(
            bytes = prompt.render().len(),
            dropped = ?prompt.dropped_sections(),
            "built synthesis prompt"
        );

        let request = GenerateRequest {
            workdir: paths.dir.clone(),
            prompt: prompt.render().to_string(),
            response_path: paths.response_path.clone(),
            log_path: paths.generator_log_path.clone(),
            timeout: self.settings.timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let dropped_sections = prompt.dropped_sections().to_vec();

        let reply = match self.generator.generate(&request) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "generation failed");
                return Ok(Synthesis {
                    candidate: Err(SynthesisFailure {
                        message: format!("{err:#}"),
                    }),
                    dropped_sections,
                    duplicate_of: None,
                });
            }
        };
        write_text(&paths.response_path, &reply)?;

        let Some(source) = extract_code(&reply, &self.settings.language) else {
            warn!("generator reply contained no code");
            return Ok(Synthesis {
                candidate: Err(SynthesisFailure {
                    message: "the reply contained no code".to_string(),
                }),
                dropped_sections,
                duplicate_of: None,
            });
        };

        let fingerprint = fingerprint(&source);
        let duplicate_of = find_duplicate(history, &fingerprint);
        if let Some(earlier) = duplicate_of {
            warn!(attempt, earlier, "candidate is identical to an earlier attempt");
        }
        let provenance = match history.last() {
            Some(previous) => Provenance::Feedback {
                from_attempt: previous.attempt,
            },
            None => Provenance::Initial,
        };
        info!(attempt, fingerprint = %&fingerprint[..12], "synthesized candidate");
        Ok(Synthesis {
            candidate: Ok(CandidateArtifact {
                attempt,
                source,
                fingerprint,
                provenance,
            }),
            dropped_sections,
            duplicate_of,
        })
    }
}

/// Hex SHA-256 of a candidate source.
pub fn fingerprint(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

fn find_duplicate(history: &[AttemptRecord], fingerprint: &str) -> Option<u32> {
    history
        .iter()
        .find(|record| {
            record
                .candidate
                .as_ref()
                .is_some_and(|c| c.fingerprint == fingerprint)
        })
        .map(|record| record.attempt)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttemptFailure, CellValue, Column, ColumnType, Verdict};
    use crate::io::attempt_log::RunPaths;
    use crate::test_support::ScriptedGenerator;

    fn target() -> Target {
        Target {
            id: "icici".to_string(),
            sample_path: "/data/icici/statement.pdf".into(),
            reference_path: "/data/icici/result.csv".into(),
            description: None,
            notes: None,
        }
    }

    fn reference() -> ReferenceDataset {
        ReferenceDataset {
            columns: vec![Column {
                name: "Amount".to_string(),
                kind: ColumnType::Float,
            }],
            rows: vec![vec![CellValue::Number(1.5)]],
        }
    }

    fn settings() -> SynthesizerSettings {
        SynthesizerSettings {
            language: "python".to_string(),
            entry_point: "parse".to_string(),
            result_hint: "a DataFrame".to_string(),
            prompt_budget_bytes: 100_000,
            sample_rows: 3,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    fn failed(attempt: u32, source: &str) -> AttemptRecord {
        AttemptRecord {
            attempt,
            candidate: Some(CandidateArtifact {
                attempt,
                source: source.to_string(),
                fingerprint: fingerprint(source),
                provenance: Provenance::Initial,
            }),
            verdict: Verdict::Fail {
                failure: AttemptFailure::Contract {
                    reason: format!("bad result {attempt}"),
                },
            },
        }
    }

    #[test]
    fn first_candidate_has_initial_provenance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new(vec![Ok(
            "```python\ndef parse(p):\n    return []\n```".to_string(),
        )]);
        let synth = Synthesizer::plan(&generator, settings(), &target(), &reference(), None);
        let paths = RunPaths::new(temp.path(), "run").attempt(1, "py");

        let synthesis = synth.synthesize(1, &[], &paths).expect("synthesize");
        let candidate = synthesis.candidate.expect("candidate");
        assert_eq!(candidate.provenance, Provenance::Initial);
        assert_eq!(candidate.source, "def parse(p):\n    return []\n");
        assert_eq!(candidate.fingerprint, fingerprint(&candidate.source));
        assert!(paths.prompt_path.is_file());
        assert!(paths.response_path.is_file());
        assert_eq!(synthesis.duplicate_of, None);
    }

    #[test]
    fn feedback_provenance_and_duplicate_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = "def parse(p):\n    return []\n";
        let generator = ScriptedGenerator::new(vec![Ok(source.to_string())]);
        let synth = Synthesizer::plan(&generator, settings(), &target(), &reference(), None);
        let paths = RunPaths::new(temp.path(), "run").attempt(3, "py");
        let history = vec![failed(1, source), failed(2, "x = 2\n")];

        let synthesis = synth.synthesize(3, &history, &paths).expect("synthesize");
        let candidate = synthesis.candidate.expect("candidate");
        assert_eq!(candidate.provenance, Provenance::Feedback { from_attempt: 2 });
        assert_eq!(synthesis.duplicate_of, Some(1));
    }

    #[test]
    fn prompt_carries_every_prior_failure() {
        let generator = ScriptedGenerator::new(Vec::new());
        let synth = Synthesizer::plan(&generator, settings(), &target(), &reference(), None);
        let history = vec![failed(1, "a = 1\n"), failed(2, "a = 1\n")];

        let prompt = synth.build_prompt(&history).expect("prompt");
        let content = prompt.render();
        assert!(content.contains("bad result 1"));
        assert!(content.contains("bad result 2"));
        assert!(content.contains("identical to attempt 1"));
        assert!(content.contains("document: statement.pdf"));
    }

    #[test]
    fn generator_error_is_synthesis_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new(vec![Err("generator timed out".to_string())]);
        let synth = Synthesizer::plan(&generator, settings(), &target(), &reference(), None);
        let paths = RunPaths::new(temp.path(), "run").attempt(1, "py");

        let synthesis = synth.synthesize(1, &[], &paths).expect("synthesize");
        let failure = synthesis.candidate.unwrap_err();
        assert!(failure.message.contains("generator timed out"));
        assert!(paths.prompt_path.is_file());
    }

    #[test]
    fn reply_without_code_is_synthesis_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new(vec![Ok("```python\n```".to_string())]);
        let synth = Synthesizer::plan(&generator, settings(), &target(), &reference(), None);
        let paths = RunPaths::new(temp.path(), "run").attempt(1, "py");

        let synthesis = synth.synthesize(1, &[], &paths).expect("synthesize");
        assert!(synthesis.candidate.is_err());
    }
}
