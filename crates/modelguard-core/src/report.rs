use std::{collections::BTreeMap, fmt::Write};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::scanner::{Ability, Category, ScanReport, Severity};

/// Format styles supported by `render_report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
    Yaml,
}

/// Fallback op name when `details` carries no recognizable identifier.
pub const UNKNOWN_OP: &str = "Unknown";

/// Our own `layer 'x'` / `node 'x'` prefix. The name is quoted with `\'`
/// and `\\` escapes and may be empty.
static SUBJECT_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(?:layer|node) '((?:[^'\\]|\\.)*)'").ok());

/// Free-text fallbacks, by priority: a JSON-ish `"name": "x"` pair, then the
/// fallback scanner's `Operator: x`.
static OP_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r#""name"\s*:\s*"([^"]+)""#, r"Operator:\s*([\w.]+)"]
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// Recover the offending record's name from an issue's free text.
pub fn op_name_from_details(details: &str) -> String {
    if let Some(quoted) = SUBJECT_PATTERN
        .as_ref()
        .and_then(|pattern| pattern.captures(details))
        .and_then(|captures| captures.get(1))
    {
        return unescape_name(quoted.as_str());
    }
    OP_NAME_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(details))
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_OP.to_string())
}

fn unescape_name(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            _ => out.push(c),
        }
    }
    out
}

/// Produce a report string from a `ScanReport` using the desired format.
pub fn render_report(report: &ScanReport, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(report),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&RenderedReport::from(report))?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(&RenderedReport::from(report))?),
    }
}

fn render_human(report: &ScanReport) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "Model: {}", report.path.display())?;
    writeln!(
        out,
        "Type: {} • scanned by {} ({} records)",
        report.format.label(),
        report.scanner,
        report.records_scanned
    )?;
    writeln!(out)?;

    if report.issues.is_empty() {
        writeln!(out, "No issues detected.")?;
        return Ok(out);
    }

    writeln!(out, "Issues:")?;
    for issue in &report.issues {
        writeln!(
            out,
            "  - [{severity}] {category} :: {ability} ({op})",
            severity = issue.severity,
            category = issue.category,
            ability = issue.ability,
            op = op_name_from_details(&issue.details),
        )?;
        writeln!(out, "    {}", sanitize_details(&issue.details))?;
    }

    writeln!(out)?;
    let counts = report
        .issues_by_severity()
        .into_iter()
        .rev()
        .map(|(severity, count)| format!("{severity}: {count}"))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(out, "Total: {} issue(s) ({counts})", report.issues.len())?;
    Ok(out)
}

fn sanitize_details(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct RenderedIssue<'a> {
    op: String,
    severity: Severity,
    category: Category,
    ability: Ability,
    details: &'a str,
}

#[derive(Debug, Serialize)]
struct RenderedReport<'a> {
    path: String,
    model_type: &'static str,
    format: crate::model::ModelFormat,
    scanner_used: crate::scanner::ScannerKind,
    records_scanned: usize,
    total_issues: usize,
    issues_by_severity: BTreeMap<Severity, usize>,
    issues: Vec<RenderedIssue<'a>>,
}

impl<'a> From<&'a ScanReport> for RenderedReport<'a> {
    fn from(report: &'a ScanReport) -> Self {
        Self {
            path: report.path.display().to_string(),
            model_type: report.format.label(),
            format: report.format,
            scanner_used: report.scanner,
            records_scanned: report.records_scanned,
            total_issues: report.issues.len(),
            issues_by_severity: report.issues_by_severity(),
            issues: report
                .issues
                .iter()
                .map(|issue| RenderedIssue {
                    op: op_name_from_details(&issue.details),
                    severity: issue.severity,
                    category: issue.category,
                    ability: issue.ability,
                    details: &issue.details,
                })
                .collect(),
        }
    }
}
