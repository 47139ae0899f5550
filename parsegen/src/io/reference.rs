//! Load the reference dataset (CSV) with per-column type inference.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::types::{CellValue, Column, ColumnType, ReferenceDataset};

/// Read a reference CSV.
///
/// The header row names the columns. A column is `integer` when every
/// non-empty field parses as `i64`, `float` when every non-empty field parses
/// as a finite `f64`, and `string` otherwise. Empty fields become `Null`.
pub fn load_reference(path: &Path) -> Result<ReferenceDataset> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .with_context(|| format!("open reference {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("read reference header {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    check_headers(&headers).with_context(|| format!("reference {}", path.display()))?;

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("read reference row {} of {}", index + 1, path.display()))?;
        raw_rows.push(record.iter().map(str::to_string).collect());
    }

    let kinds: Vec<ColumnType> = (0..headers.len())
        .map(|col| infer_type(raw_rows.iter().map(|row| row[col].as_str())))
        .collect();

    let rows = raw_rows
        .iter()
        .map(|row| {
            row.iter()
                .zip(&kinds)
                .map(|(field, kind)| convert_field(field, *kind))
                .collect()
        })
        .collect();

    let columns: Vec<Column> = headers
        .into_iter()
        .zip(kinds)
        .map(|(name, kind)| Column { name, kind })
        .collect();

    debug!(
        path = %path.display(),
        columns = columns.len(),
        rows = raw_rows.len(),
        "loaded reference dataset"
    );
    Ok(ReferenceDataset { columns, rows })
}

fn check_headers(headers: &[String]) -> Result<()> {
    if headers.is_empty() {
        return Err(anyhow!("header row is empty"));
    }
    let mut seen = HashSet::new();
    for name in headers {
        if name.is_empty() {
            return Err(anyhow!("header contains an empty column name"));
        }
        if !seen.insert(name.as_str()) {
            return Err(anyhow!("duplicate column name {name:?}"));
        }
    }
    Ok(())
}

fn infer_type<'a>(fields: impl Iterator<Item = &'a str>) -> ColumnType {
    let values: Vec<&str> = fields.filter(|field| !field.is_empty()).collect();
    if values.is_empty() {
        return ColumnType::Text;
    }
    if values.iter().all(|value| value.trim().parse::<i64>().is_ok()) {
        ColumnType::Integer
    } else if values.iter().all(|value| parse_finite(value).is_some()) {
        ColumnType::Float
    } else {
        ColumnType::Text
    }
}

fn parse_finite(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|parsed| parsed.is_finite())
}

fn convert_field(field: &str, kind: ColumnType) -> CellValue {
    if field.is_empty() {
        return CellValue::Null;
    }
    match kind {
        ColumnType::Integer => match field.trim().parse::<i64>() {
            Ok(value) => CellValue::Integer(value),
            Err(_) => CellValue::text(field),
        },
        ColumnType::Float => match parse_finite(field) {
            Some(value) => CellValue::Number(value),
            None => CellValue::text(field),
        },
        ColumnType::Text => CellValue::text(field),
    }
}
