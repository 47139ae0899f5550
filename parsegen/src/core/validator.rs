//! Exact comparison of a candidate's table against the reference dataset.
//!
//! The verdict is binary: any difference in column set, column order, row
//! count or a single cell fails the attempt. The diff only exists to tell the
//! next synthesis round what went wrong.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{
    AttemptFailure, CellValue, ExecutionOutcome, ReferenceDataset, Table, Verdict,
};

/// Expected vs actual column order when both tables hold the same column set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOrderMismatch {
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// One differing cell, addressed by 0-indexed row and column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMismatch {
    pub row: usize,
    pub column: String,
    pub expected: CellValue,
    pub actual: CellValue,
}

/// Structured description of every way a table differs from the reference.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableDiff {
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
    pub column_order: Option<ColumnOrderMismatch>,
    pub row_count: Option<RowCountMismatch>,
    /// First mismatches in row-major order, bounded by the validator limit.
    pub cell_mismatches: Vec<CellMismatch>,
    /// Total mismatched cells, including those beyond the bound.
    pub total_cell_mismatches: usize,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_columns.is_empty()
            && self.extra_columns.is_empty()
            && self.column_order.is_none()
            && self.row_count.is_none()
            && self.total_cell_mismatches == 0
    }
}

impl fmt::Display for TableDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.missing_columns.is_empty() {
            writeln!(f, "- missing columns: {:?}", self.missing_columns)?;
        }
        if !self.extra_columns.is_empty() {
            writeln!(f, "- extra columns: {:?}", self.extra_columns)?;
        }
        if let Some(order) = &self.column_order {
            writeln!(
                f,
                "- column order mismatch: expected {:?}, got {:?}",
                order.expected, order.actual
            )?;
        }
        if let Some(count) = self.row_count {
            let delta = count.actual as i64 - count.expected as i64;
            writeln!(
                f,
                "- row count mismatch: expected {}, got {} ({delta:+})",
                count.expected, count.actual
            )?;
        }
        if self.total_cell_mismatches > 0 {
            writeln!(f, "- {} mismatched cells:", self.total_cell_mismatches)?;
            for cell in &self.cell_mismatches {
                writeln!(
                    f,
                    "  - row {} column {:?}: expected {}, got {}",
                    cell.row, cell.column, cell.expected, cell.actual
                )?;
            }
            let hidden = self.total_cell_mismatches - self.cell_mismatches.len();
            if hidden > 0 {
                writeln!(f, "  - ... {hidden} more")?;
            }
        }
        Ok(())
    }
}

/// Compare `result` to `reference` exactly.
///
/// Cells are compared for every row index present in both tables and every
/// column name present in both, so a pure reordering reports only the column
/// order mismatch. At most `max_cell_mismatches` cells are listed.
pub fn validate(
    result: &Table,
    reference: &ReferenceDataset,
    max_cell_mismatches: usize,
) -> Verdict {
    let diff = diff_tables(result, reference, max_cell_mismatches);
    if diff.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Fail {
            failure: AttemptFailure::Mismatch { diff },
        }
    }
}

/// Validate any execution outcome; non-success outcomes always fail.
pub fn validate_outcome(
    outcome: &ExecutionOutcome,
    reference: &ReferenceDataset,
    max_cell_mismatches: usize,
) -> Verdict {
    let failure = match outcome {
        ExecutionOutcome::Success { result } => {
            return validate(result, reference, max_cell_mismatches);
        }
        ExecutionOutcome::SyntaxFailure { message } => AttemptFailure::Syntax {
            message: message.clone(),
        },
        ExecutionOutcome::RuntimeFailure { message, location } => AttemptFailure::Runtime {
            message: message.clone(),
            location: location.clone(),
        },
        ExecutionOutcome::ContractViolation { reason } => AttemptFailure::Contract {
            reason: reason.clone(),
        },
    };
    Verdict::Fail { failure }
}

fn diff_tables(
    result: &Table,
    reference: &ReferenceDataset,
    max_cell_mismatches: usize,
) -> TableDiff {
    let expected_columns = reference.column_names();
    let mut diff = TableDiff {
        missing_columns: expected_columns
            .iter()
            .filter(|name| !result.columns.contains(name))
            .cloned()
            .collect(),
        extra_columns: result
            .columns
            .iter()
            .filter(|name| !expected_columns.contains(name))
            .cloned()
            .collect(),
        ..TableDiff::default()
    };

    // Order is reported only when the column sets agree.
    if diff.missing_columns.is_empty()
        && diff.extra_columns.is_empty()
        && result.columns != expected_columns
    {
        diff.column_order = Some(ColumnOrderMismatch {
            expected: expected_columns.clone(),
            actual: result.columns.clone(),
        });
    }

    if result.rows.len() != reference.row_count() {
        diff.row_count = Some(RowCountMismatch {
            expected: reference.row_count(),
            actual: result.rows.len(),
        });
    }

    let shared_rows = result.rows.len().min(reference.row_count());
    for row in 0..shared_rows {
        for (index, column) in reference.columns.iter().enumerate() {
            let Some(result_index) = result.column_index(&column.name) else {
                continue;
            };
            let expected = &reference.rows[row][index];
            let actual = result.rows[row].get(result_index).unwrap_or(&CellValue::Null);
            if expected != actual {
                diff.total_cell_mismatches += 1;
                if diff.cell_mismatches.len() < max_cell_mismatches {
                    diff.cell_mismatches.push(CellMismatch {
                        row,
                        column: column.name.clone(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
            }
        }
    }

    diff
}
