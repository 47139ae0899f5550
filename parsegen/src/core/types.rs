//! Shared deterministic types for the agent core.
//!
//! These types define the contracts between the synthesizer, the sandbox, the
//! validator and the loop. They carry no I/O and serialize to stable JSON for
//! the attempt audit log.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::validator::TableDiff;

/// A single table cell.
///
/// Equality is type-aware: numbers compare by value (`1` equals `1.0`),
/// text compares verbatim, and `Null` equals only `Null`. Whole numbers are
/// kept as `Integer` so values beyond 2^53 compare exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CellValue::Null, CellValue::Null) => true,
            (CellValue::Bool(a), CellValue::Bool(b)) => a == b,
            (CellValue::Integer(a), CellValue::Integer(b)) => a == b,
            (CellValue::Number(a), CellValue::Number(b)) => a == b,
            (CellValue::Integer(i), CellValue::Number(n))
            | (CellValue::Number(n), CellValue::Integer(i)) => integer_equals_float(*i, *n),
            (CellValue::Text(a), CellValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// `i == n` without rounding `i` through `f64`.
fn integer_equals_float(i: i64, n: f64) -> bool {
    // 2^63 is exact in f64; anything at or past it cannot be an i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) && n as i64 == i
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("null"),
            CellValue::Bool(value) => write!(f, "{value}"),
            CellValue::Integer(value) => write!(f, "{value}"),
            CellValue::Number(value) => write!(f, "{value}"),
            CellValue::Text(value) => write!(f, "{value:?}"),
        }
    }
}

/// Inferred type of a reference column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    #[serde(rename = "string")]
    Text,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "string",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// Named, typed column of the reference dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

/// Tabular result produced by a candidate parser.
///
/// Column order and row order are both significant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Cell at `row` for column `name`; a missing cell reads as `None`.
    pub fn cell(&self, row: usize, name: &str) -> Option<&CellValue> {
        let index = self.column_index(name)?;
        self.rows.get(row)?.get(index)
    }

    /// Copy of the table limited to the first `rows` rows.
    pub fn head(&self, rows: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(rows).cloned().collect(),
        }
    }
}

/// The expected output for a target, loaded once per run and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDataset {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<CellValue>>,
}

impl ReferenceDataset {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// View the reference as a plain table (drops type information).
    pub fn to_table(&self) -> Table {
        Table {
            columns: self.column_names(),
            rows: self.rows.clone(),
        }
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// First attempt of the run; no prior feedback.
    Initial,
    /// Generated with the failure of `from_attempt` as feedback.
    Feedback { from_attempt: u32 },
}

/// Source text of one generated parser module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateArtifact {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub source: String,
    /// Hex SHA-256 of `source`.
    pub fingerprint: String,
    pub provenance: Provenance,
}

/// Result of running one candidate in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        result: Table,
    },
    SyntaxFailure {
        message: String,
    },
    RuntimeFailure {
        message: String,
        location: Option<String>,
    },
    ContractViolation {
        reason: String,
    },
}

impl ExecutionOutcome {
    pub fn runtime(message: impl Into<String>) -> Self {
        ExecutionOutcome::RuntimeFailure {
            message: message.into(),
            location: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::SyntaxFailure { .. } => "syntax_failure",
            ExecutionOutcome::RuntimeFailure { .. } => "runtime_failure",
            ExecutionOutcome::ContractViolation { .. } => "contract_violation",
        }
    }
}

/// Why an attempt did not pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The generator was unavailable or returned no usable code.
    Synthesis { message: String },
    /// The candidate could not be loaded or compiled.
    Syntax { message: String },
    /// The candidate raised a fault (or timed out) while parsing.
    Runtime {
        message: String,
        location: Option<String>,
    },
    /// The candidate returned something that is not a table.
    Contract { reason: String },
    /// The candidate returned a table that differs from the reference.
    Mismatch { diff: TableDiff },
}

impl AttemptFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptFailure::Synthesis { .. } => "synthesis_failure",
            AttemptFailure::Syntax { .. } => "syntax_failure",
            AttemptFailure::Runtime { .. } => "runtime_failure",
            AttemptFailure::Contract { .. } => "contract_violation",
            AttemptFailure::Mismatch { .. } => "mismatch",
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Synthesis { message } => {
                write!(f, "code generation failed: {message}")
            }
            AttemptFailure::Syntax { message } => {
                write!(f, "the module failed to load:\n{message}")
            }
            AttemptFailure::Runtime { message, location } => match location {
                Some(location) => write!(f, "parse raised an error at {location}: {message}"),
                None => write!(f, "parse raised an error: {message}"),
            },
            AttemptFailure::Contract { reason } => {
                write!(f, "the returned value is not a valid table: {reason}")
            }
            AttemptFailure::Mismatch { diff } => {
                write!(f, "the returned table does not match the reference:\n{diff}")
            }
        }
    }
}

/// Binary verdict for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { failure: AttemptFailure },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn failure(&self) -> Option<&AttemptFailure> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail { failure } => Some(failure),
        }
    }
}

/// One finished attempt in a run's history.
///
/// `candidate` is `None` when synthesis itself failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub candidate: Option<CandidateArtifact>,
    pub verdict: Verdict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(CellValue::Number(100.0), CellValue::Number(100.00));
        assert_ne!(CellValue::Number(100.0), CellValue::text("100"));
    }

    #[test]
    fn null_is_not_empty_text() {
        assert_ne!(CellValue::Null, CellValue::text(""));
    }

    #[test]
    fn cells_render_for_diagnostics() {
        assert_eq!(CellValue::Null.to_string(), "null");
        assert_eq!(CellValue::Number(100.0).to_string(), "100");
        assert_eq!(CellValue::Number(12.5).to_string(), "12.5");
        assert_eq!(CellValue::text("ATM").to_string(), "\"ATM\"");
    }

    #[test]
    fn cells_deserialize_from_json_scalars() {
        let cells: Vec<CellValue> =
            serde_json::from_str(r#"[null, true, 3, 1.5, "x"]"#).expect("parse cells");
        assert_eq!(
            cells,
            vec![
                CellValue::Null,
                CellValue::Bool(true),
                CellValue::Integer(3),
                CellValue::Number(1.5),
                CellValue::text("x"),
            ]
        );
    }

    #[test]
    fn integers_compare_exactly_past_float_precision() {
        let cells: Vec<CellValue> =
            serde_json::from_str("[12345678901234567, 12345678901234568]").expect("parse cells");
        assert!(matches!(cells[0], CellValue::Integer(12_345_678_901_234_567)));
        assert_ne!(cells[0], cells[1]);
        assert_ne!(
            CellValue::Integer(12_345_678_901_234_567),
            CellValue::Number(12_345_678_901_234_568.0)
        );
    }

    #[test]
    fn integers_equal_whole_floats() {
        assert_eq!(CellValue::Integer(100), CellValue::Number(100.0));
        assert_eq!(CellValue::Number(-3.0), CellValue::Integer(-3));
        assert_ne!(CellValue::Integer(100), CellValue::Number(100.5));
        assert_ne!(CellValue::Integer(i64::MAX), CellValue::Number(9.3e18));
        assert_ne!(CellValue::Integer(1), CellValue::text("1"));
        assert_eq!(CellValue::Integer(-7).to_string(), "-7");
    }

    #[test]
    fn table_cell_looks_up_by_column_name() {
        let table = Table {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![CellValue::Number(1.0), CellValue::text("x")]],
        };
        assert_eq!(table.cell(0, "b"), Some(&CellValue::text("x")));
        assert_eq!(table.cell(0, "c"), None);
        assert_eq!(table.cell(1, "a"), None);
    }

    #[test]
    fn verdict_serializes_with_failure_kind() {
        let verdict = Verdict::Fail {
            failure: AttemptFailure::Contract {
                reason: "rows must be arrays".to_string(),
            },
        };
        let json = serde_json::to_value(&verdict).expect("serialize");
        assert_eq!(json["verdict"], "fail");
        assert_eq!(json["failure"]["kind"], "contract");
    }
}
