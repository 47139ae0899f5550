//! Synthesis prompt builder.
//!
//! The template renders marked sections; the builder then fits them into a
//! byte budget by trimming or dropping the droppable ones. Required sections
//! (contract, target, schema, latest failure) are never cut, so the latest
//! diagnostic always reaches the generator verbatim.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::{AttemptRecord, CellValue, Column, Table};

const SYNTHESIZE_TEMPLATE: &str = include_str!("prompts/synthesize.md");

const TRUNCATED_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid regex")
});

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 3] = ["document", "history", "sample"];

/// A prior failed attempt as the generator sees it.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptView {
    pub attempt: u32,
    pub kind: String,
    /// Candidate source; absent when synthesis itself failed.
    pub source: Option<String>,
    /// Diagnostic text, verbatim.
    pub failure: String,
    /// Earlier attempt with byte-identical source, if any.
    pub duplicate_of: Option<u32>,
}

impl AttemptView {
    pub fn from_record(record: &AttemptRecord, duplicate_of: Option<u32>) -> Self {
        let (kind, failure) = match record.verdict.failure() {
            Some(failure) => (failure.kind().to_string(), failure.to_string()),
            None => ("pass".to_string(), String::new()),
        };
        Self {
            attempt: record.attempt,
            kind,
            source: record.candidate.as_ref().map(|c| c.source.trim_end().to_string()),
            failure,
            duplicate_of,
        }
    }
}

/// All inputs needed to build a synthesis prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub target_id: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    /// File name of the sample document.
    pub document_name: String,
    pub language: String,
    pub entry_point: String,
    pub result_hint: String,
    pub columns: Vec<Column>,
    pub row_count: usize,
    /// Leading rows of the expected result.
    pub sample: Table,
    pub document_preview: Option<String>,
    /// Failed attempts before the latest one, oldest first.
    pub history: Vec<AttemptView>,
    pub latest: Option<AttemptView>,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections using `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required: kind.as_str() == "required",
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

/// Fit sections into `budget` bytes, returning the keys that were dropped.
///
/// Each droppable section in [`DROP_ORDER`] is trimmed when that alone is
/// enough, otherwise removed. Required sections are left intact even if the
/// result stays over budget.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) -> Vec<String> {
    let mut dropped = Vec::new();
    for key in DROP_ORDER {
        let total = total_len(sections);
        if total <= budget {
            break;
        }
        let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) else {
            continue;
        };
        let excess = total - budget;
        let section = &mut sections[idx];
        let keep = section.content.len().saturating_sub(excess + TRUNCATED_MARKER.len());
        if keep >= section.content.len() / 4 && keep > 0 {
            let mut cut = keep;
            while !section.content.is_char_boundary(cut) {
                cut -= 1;
            }
            let before_len = section.content.len();
            section.content.truncate(cut);
            section.content.push_str(TRUNCATED_MARKER);
            debug!(
                section = key,
                before_len,
                after_len = section.content.len(),
                "truncated section for budget"
            );
        } else {
            debug!(
                section = key,
                bytes_dropped = section.content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
            dropped.push(key.to_string());
        }
    }
    let total = total_len(sections);
    if total > budget {
        warn!(total, budget, "required prompt sections exceed the budget");
    }
    dropped
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut content = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    content.push('\n');
    content
}

/// Render the expected rows compactly, one JSON array per line.
fn render_sample(table: &Table) -> Result<Option<String>> {
    if table.rows.is_empty() {
        return Ok(None);
    }
    let mut lines = vec![format!(
        "columns: {}",
        serde_json::to_string(&table.columns).context("serialize sample columns")?
    )];
    for row in &table.rows {
        lines.push(render_row(row)?);
    }
    Ok(Some(lines.join("\n")))
}

fn render_row(row: &[CellValue]) -> Result<String> {
    serde_json::to_string(row).context("serialize sample row")
}

/// Builds synthesis prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("synthesize", SYNTHESIZE_TEMPLATE)
            .context("load synthesis template")?;
        let template = env.get_template("synthesize")?;

        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let rendered = template
            .render(context! {
                language => &input.language,
                entry_point => &input.entry_point,
                result_hint => &input.result_hint,
                target_id => &input.target_id,
                document_name => &input.document_name,
                description => non_empty(&input.description),
                notes => non_empty(&input.notes),
                columns => &input.columns,
                row_count => input.row_count,
                sample => render_sample(&input.sample)?,
                sample_len => input.sample.rows.len(),
                document => non_empty(&input.document_preview),
                history => &input.history,
                latest => &input.latest,
            })
            .context("render synthesis prompt")?;

        let mut sections = parse_sections(&rendered);
        let dropped = apply_budget(&mut sections, self.budget_bytes);
        Ok(PromptPack {
            content: render_sections(&sections),
            dropped,
        })
    }
}

/// A rendered prompt ready to send to the generator.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
    dropped: Vec<String>,
}

impl PromptPack {
    pub fn render(&self) -> &str {
        &self.content
    }

    /// Sections removed to fit the budget.
    pub fn dropped_sections(&self) -> &[String] {
        &self.dropped
    }
}
