//! Test-only fakes for the generator and sandbox boundaries, plus target fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::types::{CellValue, ExecutionOutcome, Table};
use crate::io::generator::{GenerateRequest, Generator};
use crate::io::sandbox::{Sandbox, SandboxRequest};

/// Generator returning scripted replies in order and recording every prompt.
///
/// `Err(message)` entries simulate an unavailable backend. Once the script is
/// exhausted every call fails.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with `reply`.
    pub fn repeating(reply: &str, times: usize) -> Self {
        Self::new(vec![Ok(reply.to_string()); times])
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts().len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.prompts
            .lock()
            .map_err(|_| anyhow!("prompt log poisoned"))?
            .push(request.prompt.clone());
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("reply script poisoned"))?
            .pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted generator has no more replies")),
        }
    }
}

/// Sandbox returning scripted outcomes in order and recording each candidate source.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    sources: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, request: &SandboxRequest<'_>) -> Result<ExecutionOutcome> {
        self.sources
            .lock()
            .map_err(|_| anyhow!("source log poisoned"))?
            .push(request.candidate.source.clone());
        if request.cancel.is_some_and(|token| token.is_cancelled()) {
            return Ok(ExecutionOutcome::runtime("cancelled"));
        }
        self.outcomes
            .lock()
            .map_err(|_| anyhow!("outcome script poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted sandbox has no more outcomes"))
    }
}

/// Reference used by the fixtures: `[date, description, amount]`, two rows.
pub const STATEMENT_CSV: &str = "date,description,amount\n\
01-08-2024,ATM withdrawal,100\n\
02-08-2024,Salary,2500.5\n";

/// The table a correct parser returns for [`STATEMENT_CSV`].
pub fn statement_table() -> Table {
    Table {
        columns: vec![
            "date".to_string(),
            "description".to_string(),
            "amount".to_string(),
        ],
        rows: vec![
            vec![
                CellValue::text("01-08-2024"),
                CellValue::text("ATM withdrawal"),
                CellValue::Number(100.0),
            ],
            vec![
                CellValue::text("02-08-2024"),
                CellValue::text("Salary"),
                CellValue::Number(2500.5),
            ],
        ],
    }
}

/// [`statement_table`] serialized the way a candidate prints it.
pub fn statement_json() -> String {
    serde_json::to_string(&statement_table()).unwrap_or_default()
}

/// Create `<data_dir>/<id>/` with a reference CSV and one sample document.
pub fn write_target(data_dir: &Path, id: &str, reference_csv: &str) -> PathBuf {
    let dir = data_dir.join(id);
    fs::create_dir_all(&dir).expect("create target dir");
    fs::write(dir.join("result.csv"), reference_csv).expect("write reference");
    fs::write(dir.join("statement.txt"), "01-08-2024 ATM withdrawal 100\n")
        .expect("write sample");
    dir
}
