use std::{
    path::Path,
    process::{Command, Stdio},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{FallbackFinding, FallbackScanner};
use crate::settings::FallbackSettings;

/// Runs an external scanner process that speaks the modelscan CLI:
/// `<program> <args...> -p <path> -r json`, with a JSON report on stdout.
#[derive(Debug, Clone)]
pub struct CommandFallbackScanner {
    program: String,
    args: Vec<String>,
}

impl CommandFallbackScanner {
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_args(program, Vec::new())
    }

    pub fn with_args(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl FallbackScanner for CommandFallbackScanner {
    #[instrument(name = "fallback_scan", skip(self), fields(program = %self.program))]
    fn scan(&self, path: &Path) -> Result<Vec<FallbackFinding>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("-p")
            .arg(path)
            .args(["-r", "json"])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to launch fallback scanner `{}`", self.program))?;

        // 0 = clean, 1 = issues found; anything else means the artifact was not scanned.
        match output.status.code() {
            Some(0) | Some(1) => {}
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "`{}` exited with status {}: {}",
                    self.program,
                    code.map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    stderr.trim()
                );
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let findings = parse_report(&stdout)
            .with_context(|| format!("unreadable report from `{}`", self.program))?;
        debug!(findings = findings.len(), "fallback scan completed");
        Ok(findings)
    }
}

/// Stand-in used when no fallback program is configured. Fails rather than
/// returning zero findings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFallbackScanner;

impl FallbackScanner for NoFallbackScanner {
    fn scan(&self, _path: &Path) -> Result<Vec<FallbackFinding>> {
        Err(anyhow!("no fallback scanner configured"))
    }
}

/// Build the collaborator described by `settings`.
pub fn from_settings(settings: &FallbackSettings) -> Arc<dyn FallbackScanner> {
    match &settings.command {
        Some(program) => Arc::new(CommandFallbackScanner::with_args(
            program.clone(),
            settings.args.clone(),
        )),
        None => Arc::new(NoFallbackScanner),
    }
}

#[derive(Debug, Deserialize)]
struct ExternalReport {
    issues: Option<Vec<FallbackFinding>>,
}

/// Parse a modelscan-style JSON report. Log lines before the JSON body are
/// skipped, including ones that contain braces: each line that opens with
/// `{` is tried in turn, and an object carrying `issues` wins over one
/// that does not.
pub fn parse_report(stdout: &str) -> Result<Vec<FallbackFinding>> {
    let mut without_issues = false;
    let mut last_error = None;
    let mut offset = 0;
    for line in stdout.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let start = offset + (line.len() - trimmed.len());
        offset += line.len();
        if !trimmed.starts_with('{') {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&stdout[start..])
            .into_iter::<ExternalReport>();
        match stream.next() {
            Some(Ok(ExternalReport {
                issues: Some(issues),
            })) => return Ok(issues),
            Some(Ok(ExternalReport { issues: None })) => without_issues = true,
            Some(Err(err)) => last_error = Some(err),
            None => {}
        }
    }

    if without_issues {
        return Ok(Vec::new());
    }
    match last_error {
        Some(err) => Err(err).context("invalid JSON report"),
        None => bail!("no JSON object in scanner output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Category, Severity};

    #[test]
    fn parses_modelscan_report() {
        let stdout = r#"No settings file detected
{"summary": {"total_issues": 2},
 "issues": [
   {"description": "Use of unsafe operator 'system' from module 'posix'",
    "operator": "system", "module": "posix", "source": "model.pkl",
    "scanner": "modelscan.scanners.PickleUnsafeOpScan", "severity": "CRITICAL"},
   {"description": "Use of unsafe operator 'getattr'", "severity": "MEDIUM"}
 ],
 "errors": []}"#;
        let findings = parse_report(stdout).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].operator.as_deref(), Some("system"));
        assert_eq!(findings[0].location.as_deref(), Some("model.pkl"));

        let issue = findings[0].clone().into_issue();
        assert_eq!(issue.severity, Severity::High);
        assert_eq!(issue.category, Category::Unknown);
        assert!(issue.details.starts_with("Operator: system"));

        let second = findings[1].clone().into_issue();
        assert_eq!(second.severity, Severity::Mid);
        assert!(second.details.contains("location: unknown"));
    }

    #[test]
    fn log_lines_with_braces_are_skipped() {
        let stdout = r#"loading settings {path: ~/.modelscan}
{"level": "info", "msg": "starting"}
{"summary": {"total_issues": 1},
 "issues": [{"description": "unsafe operator", "operator": "eval", "severity": "HIGH"}]}"#;
        let findings = parse_report(stdout).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].operator.as_deref(), Some("eval"));
    }

    #[test]
    fn missing_issues_array_is_empty() {
        assert!(parse_report(r#"{"summary": {}}"#).unwrap().is_empty());
    }

    #[test]
    fn non_json_output_is_an_error() {
        assert!(parse_report("scanner crashed").is_err());
        let err = parse_report("scanner crashed\n{not json").unwrap_err();
        assert!(err.to_string().contains("invalid JSON report"));
    }

    #[test]
    fn unconfigured_fallback_fails() {
        let err = NoFallbackScanner.scan(Path::new("model.pkl")).unwrap_err();
        assert!(err.to_string().contains("no fallback scanner configured"));
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let scanner = CommandFallbackScanner::new("modelguard-no-such-scanner-binary");
        let err = scanner.scan(Path::new("model.pkl")).unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }

    #[test]
    fn settings_select_collaborator() {
        let unset = from_settings(&FallbackSettings::default());
        assert!(unset.scan(Path::new("x")).is_err());
    }
}
