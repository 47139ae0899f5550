//! The parser contract as seen from the harness side.
//!
//! A candidate run prints one JSON document on stdout. This module decides
//! whether that document is a table; a `Err(reason)` here becomes a
//! `ContractViolation` outcome.

use std::collections::HashSet;

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::types::{CellValue, Table};

const TABULAR_RESULT_SCHEMA: &str = include_str!("../../schemas/tabular_result.schema.json");

/// Exit code a driver uses when the candidate fails to load or compile.
pub const LOAD_FAILURE_EXIT_CODE: i32 = 64;
/// Exit code a driver uses when the entry point is missing or returns a non-table.
pub const CONTRACT_VIOLATION_EXIT_CODE: i32 = 65;

/// Parse candidate stdout into a [`Table`].
///
/// Returns `Ok(Err(reason))` for contract violations so callers can tell them
/// apart from a broken embedded schema.
pub fn parse_tabular_result(stdout: &str) -> Result<std::result::Result<Table, String>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Err("no output on stdout".to_string()));
    }
    let instance: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => return Ok(Err(format!("stdout is not a JSON document: {err}"))),
    };

    let schema: Value =
        serde_json::from_str(TABULAR_RESULT_SCHEMA).context("parse tabular result schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile tabular result schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Ok(Err(format!(
            "result does not match the table shape: {}",
            messages.join("; ")
        )));
    }

    Ok(table_from_value(instance))
}

fn table_from_value(instance: Value) -> std::result::Result<Table, String> {
    let Value::Object(mut object) = instance else {
        return Err("result must be an object".to_string());
    };
    let columns: Vec<String> = match object.remove("columns") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(name),
                _ => None,
            })
            .collect(),
        _ => return Err("columns must be an array of strings".to_string()),
    };

    let mut seen = HashSet::new();
    for name in &columns {
        if !seen.insert(name.as_str()) {
            return Err(format!("duplicate column {name:?}"));
        }
    }

    let Some(Value::Array(raw_rows)) = object.remove("rows") else {
        return Err("rows must be an array of arrays".to_string());
    };
    let mut rows = Vec::with_capacity(raw_rows.len());
    for (index, raw) in raw_rows.into_iter().enumerate() {
        let Value::Array(cells) = raw else {
            return Err(format!("row {index} is not an array"));
        };
        if cells.len() != columns.len() {
            return Err(format!(
                "row {index} has {} cells but there are {} columns",
                cells.len(),
                columns.len()
            ));
        }
        rows.push(cells.into_iter().map(cell_from_value).collect::<Result<Vec<_>, _>>()?);
    }

    Ok(Table { columns, rows })
}

fn cell_from_value(value: Value) -> std::result::Result<CellValue, String> {
    match value {
        Value::Null => Ok(CellValue::Null),
        Value::Bool(value) => Ok(CellValue::Bool(value)),
        Value::Number(number) => match number.as_i64() {
            Some(value) => Ok(CellValue::Integer(value)),
            None => number
                .as_f64()
                .map(CellValue::Number)
                .ok_or_else(|| format!("number {number} is out of range")),
        },
        Value::String(value) => Ok(CellValue::Text(value)),
        other => Err(format!("cell {other} is not a scalar")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(stdout: &str) -> String {
        parse_tabular_result(stdout)
            .expect("schema compiles")
            .expect_err("contract violation")
    }

    #[test]
    fn parses_well_formed_table() {
        let table = parse_tabular_result(
            r#"{"columns": ["date", "amount"], "rows": [["2024-01-02", 10.5], ["2024-01-03", null]]}"#,
        )
        .expect("schema compiles")
        .expect("valid table");

        assert_eq!(table.columns, vec!["date", "amount"]);
        assert_eq!(table.rows[0][1], CellValue::Number(10.5));
        assert_eq!(table.rows[1][1], CellValue::Null);
    }

    #[test]
    fn large_integers_keep_every_digit() {
        let table = parse_tabular_result(r#"{"columns": ["id"], "rows": [[12345678901234567]]}"#)
            .expect("schema compiles")
            .expect("valid table");
        assert!(matches!(table.rows[0][0], CellValue::Integer(12_345_678_901_234_567)));
        assert_ne!(table.rows[0][0], CellValue::Integer(12_345_678_901_234_568));
    }

    #[test]
    fn empty_stdout_is_a_violation() {
        assert!(violation("  \n").contains("no output"));
    }

    #[test]
    fn non_json_stdout_is_a_violation() {
        assert!(violation("Date,Amount\n").contains("not a JSON document"));
    }

    #[test]
    fn wrong_shape_is_a_violation() {
        let reason = violation(r#"{"columns": "date", "rows": []}"#);
        assert!(reason.contains("table shape"), "{reason}");

        let reason = violation(r#"{"columns": ["a"], "rows": [[{"nested": 1}]]}"#);
        assert!(reason.contains("table shape"), "{reason}");
    }

    #[test]
    fn ragged_rows_are_a_violation() {
        let reason = violation(r#"{"columns": ["a", "b"], "rows": [["x"]]}"#);
        assert!(reason.contains("row 0 has 1 cells"), "{reason}");
    }

    #[test]
    fn duplicate_columns_are_a_violation() {
        let reason = violation(r#"{"columns": ["a", "a"], "rows": []}"#);
        assert!(reason.contains("duplicate column"), "{reason}");
    }
}
