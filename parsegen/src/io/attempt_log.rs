//! Attempt audit logs under `<state_dir>/runs/<run_id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use crate::core::types::{
    AttemptFailure, CandidateArtifact, ExecutionOutcome, Provenance, Verdict,
};

/// `<target>_<UTC timestamp>_<6 lowercase alphanumerics>`.
pub fn new_run_id(target_id: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut rng = rand::thread_rng();
    let short_id = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{target_id}_{timestamp}_{short_id}")
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub summary_path: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, run_id: &str) -> Self {
        let dir = state_dir.join("runs").join(run_id);
        Self {
            summary_path: dir.join("summary.json"),
            dir,
        }
    }

    pub fn attempt(&self, attempt: u32, extension: &str) -> AttemptPaths {
        AttemptPaths::new(&self.dir, attempt, extension)
    }
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub candidate_path: PathBuf,
    pub generator_log_path: PathBuf,
    pub sandbox_log_path: PathBuf,
    pub outcome_path: PathBuf,
    pub verdict_path: PathBuf,
    pub meta_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(run_dir: &Path, attempt: u32, extension: &str) -> Self {
        let dir = run_dir.join(attempt.to_string());
        Self {
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            candidate_path: dir.join(format!("candidate.{extension}")),
            generator_log_path: dir.join("generator.log"),
            sandbox_log_path: dir.join("sandbox.log"),
            outcome_path: dir.join("outcome.json"),
            verdict_path: dir.join("verdict.json"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create attempt dir {}", self.dir.display()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub run_id: String,
    pub target_id: String,
    pub attempt: u32,
    pub fingerprint: Option<String>,
    pub provenance: Option<Provenance>,
    pub duplicate_of: Option<u32>,
    pub verdict: String,
    pub dropped_sections: Vec<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

pub struct AttemptWriteRequest<'a> {
    pub paths: &'a AttemptPaths,
    pub candidate: Option<&'a CandidateArtifact>,
    pub outcome: Option<&'a ExecutionOutcome>,
    pub verdict: &'a Verdict,
    pub meta: &'a AttemptMeta,
}

/// Write the results of one finished attempt. The prompt is written earlier
/// via [`write_text`] so it survives a generator crash.
pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<()> {
    let paths = request.paths;
    paths.create()?;
    if let Some(candidate) = request.candidate {
        write_text(&paths.candidate_path, &candidate.source)?;
    }
    if let Some(outcome) = request.outcome {
        write_json(&paths.outcome_path, outcome)?;
    }
    write_json(&paths.verdict_path, request.verdict)?;
    write_json(&paths.meta_path, request.meta)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub verdict: String,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub target_id: String,
    /// `success`, `exhausted` or `cancelled`.
    pub outcome: String,
    pub parser_path: Option<PathBuf>,
    pub last_failure: Option<AttemptFailure>,
    pub attempts: Vec<AttemptSummary>,
    pub started_at: String,
    pub ended_at: String,
}

pub fn write_summary(paths: &RunPaths, summary: &RunSummary) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;
    write_json(&paths.summary_path, summary)
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_target_timestamp_and_suffix() {
        let id = new_run_id("icici");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4, "{id}");
        assert_eq!(parts[0], "icici");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 6);
        assert!(
            parts[3]
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
        );
    }

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunPaths::new(temp.path(), "icici_1");
        let paths = run.attempt(2, "py");

        assert!(paths.dir.ends_with(Path::new("runs/icici_1/2")));
        assert!(paths.candidate_path.ends_with("candidate.py"));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(run.summary_path.ends_with("runs/icici_1/summary.json"));
    }

    #[test]
    fn writes_attempt_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-9").attempt(1, "py");
        let candidate = CandidateArtifact {
            attempt: 1,
            source: "def parse(p): pass\n".to_string(),
            fingerprint: "abc".to_string(),
            provenance: Provenance::Initial,
        };
        let outcome = ExecutionOutcome::runtime("timeout");
        let verdict = Verdict::Fail {
            failure: AttemptFailure::Runtime {
                message: "timeout".to_string(),
                location: None,
            },
        };
        let meta = AttemptMeta {
            run_id: "run-9".to_string(),
            target_id: "icici".to_string(),
            attempt: 1,
            fingerprint: Some("abc".to_string()),
            provenance: Some(Provenance::Initial),
            duplicate_of: None,
            verdict: "runtime_failure".to_string(),
            dropped_sections: Vec::new(),
            started_at: Utc::now().to_rfc3339(),
            ended_at: Utc::now().to_rfc3339(),
            duration_ms: 5,
        };

        write_attempt(&AttemptWriteRequest {
            paths: &paths,
            candidate: Some(&candidate),
            outcome: Some(&outcome),
            verdict: &verdict,
            meta: &meta,
        })
        .expect("write attempt");

        assert_eq!(
            fs::read_to_string(&paths.candidate_path).expect("read"),
            candidate.source
        );
        let verdict_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.verdict_path).expect("read"))
                .expect("parse");
        assert_eq!(verdict_json["failure"]["kind"], "runtime");
        assert!(paths.outcome_path.is_file());
        assert!(paths.meta_path.is_file());
        assert!(!paths.sandbox_log_path.exists());
    }
}
