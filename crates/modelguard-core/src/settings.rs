use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::classify::DEFAULT_MAX_DETAILS_CHARS;

/// External scanner consulted for artifacts the engine cannot parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Program to run, e.g. `modelscan`. `None` disables the fallback.
    pub command: Option<String>,
    /// Extra arguments placed before `-p <path> -r json`.
    pub args: Vec<String>,
}

/// Engine tunables. Deserializable from a config file; `apply_env` layers
/// environment overrides on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub fallback: FallbackSettings,
    pub timeout_secs: Option<u64>,
    pub max_details_chars: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            fallback: FallbackSettings::default(),
            timeout_secs: None,
            max_details_chars: DEFAULT_MAX_DETAILS_CHARS,
        }
    }
}

impl ScanSettings {
    pub const FALLBACK_CMD_ENV: &'static str = "MODELGUARD_FALLBACK_CMD";
    pub const FALLBACK_ARGS_ENV: &'static str = "MODELGUARD_FALLBACK_ARGS";
    pub const TIMEOUT_ENV: &'static str = "MODELGUARD_TIMEOUT_SECS";
    pub const MAX_DETAILS_ENV: &'static str = "MODELGUARD_MAX_DETAILS";

    /// Defaults plus environment overrides.
    ///
    /// * `MODELGUARD_FALLBACK_CMD`: fallback scanner program.
    /// * `MODELGUARD_FALLBACK_ARGS`: whitespace-separated extra arguments.
    /// * `MODELGUARD_TIMEOUT_SECS`: per-scan time budget in seconds.
    /// * `MODELGUARD_MAX_DETAILS`: cap on rendered attribute text per issue.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env()?;
        Ok(settings)
    }

    /// Override fields present in the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_map(&std::env::vars().collect())
    }

    fn apply_map(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let value = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(command) = value(Self::FALLBACK_CMD_ENV) {
            self.fallback.command = Some(command);
        }
        if let Some(args) = value(Self::FALLBACK_ARGS_ENV) {
            self.fallback.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(timeout) = value(Self::TIMEOUT_ENV) {
            let secs = timeout
                .parse::<u64>()
                .with_context(|| format!("{} must be a whole number of seconds", Self::TIMEOUT_ENV))?;
            self.timeout_secs = Some(secs);
        }
        if let Some(max) = value(Self::MAX_DETAILS_ENV) {
            self.max_details_chars = max
                .parse::<usize>()
                .with_context(|| format!("{} must be a character count", Self::MAX_DETAILS_ENV))?;
        }
        Ok(())
    }
}
