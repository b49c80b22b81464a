use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ModelFormat;

pub mod fallback;
pub mod model_scanner;

/// How urgently an issue should be looked at. Ordered `Low < Mid < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Mid,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }

    /// Best-effort mapping of a severity label produced by another tool.
    /// Unknown labels collapse to `Low`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" => Self::High,
            "medium" | "mid" | "moderate" => Self::Mid,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the model structure a dangerous construct was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// A low-level graph operation abused for I/O or execution.
    #[serde(rename = "tensor abuse")]
    TensorOpAbuse,
    /// A high-level layer that carries an arbitrary callable.
    #[serde(rename = "lambda layer")]
    LambdaLayer,
    /// Finding reported by the fallback scanner, which has no category of its own.
    #[serde(rename = "unknown")]
    Unknown,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TensorOpAbuse => "tensor abuse",
            Self::LambdaLayer => "lambda layer",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a malicious construct could do once the model is loaded or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ability {
    #[serde(rename = "None")]
    None,
    #[serde(rename = "Arbitrary file write")]
    FileWrite,
    #[serde(rename = "Arbitrary file read")]
    FileRead,
    #[serde(rename = "Arbitrary directory read")]
    DirectoryRead,
    #[serde(rename = "Network access")]
    Network,
    #[serde(rename = "Code execution")]
    CodeExecution,
}

impl Ability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::FileWrite => "Arbitrary file write",
            Self::FileRead => "Arbitrary file read",
            Self::DirectoryRead => "Arbitrary directory read",
            Self::Network => "Network access",
            Self::CodeExecution => "Code execution",
        }
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding. `details` always starts with the offending record's
/// name and type so reporting can recover the op name from text alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub category: Category,
    pub ability: Ability,
    pub details: String,
}

impl Issue {
    pub fn new(
        severity: Severity,
        category: Category,
        ability: Ability,
        details: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            ability,
            details: details.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} | ability: {} | {}",
            self.severity, self.category, self.ability, self.details
        )
    }
}

/// Which engine produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerKind {
    /// Built-in structural walk + rule classifier.
    Builtin,
    /// External fallback collaborator.
    Fallback,
}

impl ScannerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one completed scan. Issues keep extraction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub path: PathBuf,
    pub format: ModelFormat,
    pub scanner: ScannerKind,
    pub records_scanned: usize,
    pub issues: Vec<Issue>,
}

impl ScanReport {
    pub fn new(
        path: impl Into<PathBuf>,
        format: ModelFormat,
        scanner: ScannerKind,
        records_scanned: usize,
        issues: Vec<Issue>,
    ) -> Self {
        Self {
            path: path.into(),
            format,
            scanner,
            records_scanned,
            issues,
        }
    }

    /// Issue counts keyed by severity, highest first when iterated in reverse.
    pub fn issues_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|issue| issue.severity).max()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Closed classification of scan failures, for callers that persist or
/// transmit the failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidPath,
    StructuralParseError,
    FallbackFailed,
    Cancelled,
}

/// Report-level scan failure. A failed scan never yields a report.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read model at {path}: {source}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{format} structure is malformed: {reason}")]
    StructuralParse { format: ModelFormat, reason: String },
    #[error("fallback scanner failed: {reason}")]
    Fallback { reason: String },
    #[error("scan cancelled")]
    Cancelled,
}

impl ScanError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidPath { .. } => FailureKind::InvalidPath,
            Self::StructuralParse { .. } => FailureKind::StructuralParseError,
            Self::Fallback { .. } => FailureKind::FallbackFailed,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    pub(crate) fn invalid_path(path: &Path, source: std::io::Error) -> Self {
        Self::InvalidPath {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn structural(format: ModelFormat, reason: impl Into<String>) -> Self {
        Self::StructuralParse {
            format,
            reason: reason.into(),
        }
    }
}

/// Shared progress counters for an in-flight scan. Atomics only, so a UI or
/// job runner can poll and cancel from another thread without locking.
#[derive(Debug, Default)]
pub struct ScanProgress {
    pub total_records: AtomicUsize,
    pub processed_records: AtomicUsize,
    pub issues_found: AtomicUsize,
    pub cancel: AtomicBool,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the scan to stop at the next record boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Fraction of records processed, in `0.0..=1.0`. Zero until the
    /// record total is known.
    pub fn fraction(&self) -> f32 {
        let total = self.total_records.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.processed_records.load(Ordering::Relaxed).min(total);
        done as f32 / total as f32
    }
}

/// Primary engine interface: one artifact path in, one report out.
pub trait Scanner: Send + Sync {
    fn scan_with_progress(
        &self,
        path: &Path,
        progress: &ScanProgress,
    ) -> Result<ScanReport, ScanError>;

    fn scan(&self, path: &Path) -> Result<ScanReport, ScanError> {
        self.scan_with_progress(path, &ScanProgress::new())
    }
}

/// A finding as reported by an external scanner. Every field is optional
/// because the collaborator's output is not under our control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackFinding {
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default, alias = "source")]
    pub location: Option<String>,
}

impl FallbackFinding {
    /// Fold into the unified issue shape. Category and ability are not
    /// known to the fallback taxonomy.
    pub fn into_issue(self) -> Issue {
        let severity = self
            .severity
            .as_deref()
            .map(Severity::from_label)
            .unwrap_or(Severity::Low);
        let details = format!(
            "Operator: {} | location: {} | {}",
            self.operator.as_deref().unwrap_or("unknown"),
            self.location.as_deref().unwrap_or("unknown"),
            self.description.as_deref().unwrap_or("no description"),
        );
        Issue::new(severity, Category::Unknown, Ability::None, details)
    }
}

/// External collaborator consulted for formats the engine does not parse.
pub trait FallbackScanner: Send + Sync {
    fn scan(&self, path: &Path) -> anyhow::Result<Vec<FallbackFinding>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_high_above_low() {
        assert!(Severity::High > Severity::Mid);
        assert!(Severity::Mid > Severity::Low);
    }

    #[test]
    fn severity_labels_map_best_effort() {
        assert_eq!(Severity::from_label("CRITICAL"), Severity::High);
        assert_eq!(Severity::from_label("High"), Severity::High);
        assert_eq!(Severity::from_label("MEDIUM"), Severity::Mid);
        assert_eq!(Severity::from_label("low"), Severity::Low);
        assert_eq!(Severity::from_label("whatever"), Severity::Low);
    }

    #[test]
    fn issue_display_carries_all_four_fields() {
        let issue = Issue::new(
            Severity::High,
            Category::LambdaLayer,
            Ability::CodeExecution,
            "layer 'lambda' (Lambda)",
        );
        let text = issue.to_string();
        assert!(text.contains("high"));
        assert!(text.contains("lambda layer"));
        assert!(text.contains("Code execution"));
        assert!(text.contains("layer 'lambda' (Lambda)"));
    }

    #[test]
    fn taxonomy_serializes_to_display_strings() {
        let issue = Issue::new(
            Severity::Mid,
            Category::TensorOpAbuse,
            Ability::FileRead,
            "node 'r' (ReadFile)",
        );
        let value = serde_json::to_value(&issue).unwrap();
        assert_eq!(value["severity"], "mid");
        assert_eq!(value["category"], "tensor abuse");
        assert_eq!(value["ability"], "Arbitrary file read");
    }

    #[test]
    fn report_groups_issues_by_severity() {
        let issues = vec![
            Issue::new(Severity::High, Category::LambdaLayer, Ability::CodeExecution, "a"),
            Issue::new(Severity::Low, Category::TensorOpAbuse, Ability::None, "b"),
            Issue::new(Severity::High, Category::TensorOpAbuse, Ability::FileWrite, "c"),
        ];
        let report = ScanReport::new("m.h5", ModelFormat::Hdf5, ScannerKind::Builtin, 3, issues);
        let counts = report.issues_by_severity();
        assert_eq!(counts.get(&Severity::High), Some(&2));
        assert_eq!(counts.get(&Severity::Low), Some(&1));
        assert_eq!(counts.get(&Severity::Mid), None);
        assert_eq!(report.highest_severity(), Some(Severity::High));
        assert!(!report.is_clean());
    }

    #[test]
    fn failure_kinds_are_distinct() {
        let err = ScanError::structural(ModelFormat::SavedModel, "truncated");
        assert_eq!(err.kind(), FailureKind::StructuralParseError);
        assert!(err.to_string().contains("truncated"));
        assert_eq!(ScanError::Cancelled.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn progress_fraction_is_bounded() {
        let progress = ScanProgress::new();
        assert_eq!(progress.fraction(), 0.0);
        progress.total_records.store(4, Ordering::Relaxed);
        progress.processed_records.store(1, Ordering::Relaxed);
        assert!((progress.fraction() - 0.25).abs() < f32::EPSILON);
        progress.processed_records.store(9, Ordering::Relaxed);
        assert!((progress.fraction() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn fallback_finding_tolerates_missing_fields() {
        let issue = FallbackFinding::default().into_issue();
        assert_eq!(issue.severity, Severity::Low);
        assert_eq!(issue.category, Category::Unknown);
        assert_eq!(issue.ability, Ability::None);
        assert!(issue.details.starts_with("Operator: unknown"));
    }
}
