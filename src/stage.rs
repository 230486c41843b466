use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Format,
    Lint,
    SecurityScan,
    PolicyScan,
    Docs,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Format,
        StageKind::Lint,
        StageKind::SecurityScan,
        StageKind::PolicyScan,
        StageKind::Docs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Format => "format",
            StageKind::Lint => "lint",
            StageKind::SecurityScan => "security-scan",
            StageKind::PolicyScan => "policy-scan",
            StageKind::Docs => "docs",
        }
    }

    pub fn default_stage_name(&self) -> &'static str {
        match self {
            StageKind::Docs => "docs-drift",
            other => other.as_str(),
        }
    }

    /// The formatter always runs; every other kind is flag-gated.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, StageKind::Format)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageKind::Format => "terraform fmt -check (mandatory)",
            StageKind::Lint => "tflint static analysis",
            StageKind::SecurityScan => "tfsec security scanner",
            StageKind::PolicyScan => "checkov policy scanner",
            StageKind::Docs => "terraform-docs regeneration with drift detection",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "format" | "fmt" => Ok(StageKind::Format),
            "lint" | "tflint" => Ok(StageKind::Lint),
            "security-scan" | "security" | "tfsec" => Ok(StageKind::SecurityScan),
            "policy-scan" | "policy" | "checkov" => Ok(StageKind::PolicyScan),
            "docs" | "docs-drift" | "terraform-docs" => Ok(StageKind::Docs),
            other => bail!(
                "Unknown stage kind '{}'. Available kinds: {}",
                other,
                StageKind::ALL
                    .iter()
                    .map(StageKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Final state of a single stage in one run.
///
/// `Skipped` is reserved for stages whose flag is off. `NotRun` marks an
/// enabled stage that never produced a verdict (tool missing, crash, cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageOutcome {
    Passed,
    Failed,
    Skipped,
    NotRun,
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Passed => "passed",
            StageOutcome::Failed => "failed",
            StageOutcome::Skipped => "skipped",
            StageOutcome::NotRun => "not run",
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            StageOutcome::Passed => "✔",
            StageOutcome::Failed => "✖",
            StageOutcome::Skipped => "○",
            StageOutcome::NotRun => "⚠",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failed | StageOutcome::NotRun)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StageOutcome {
    type Err = anyhow::Error;

    /// Accepts both our own labels and the step outcomes reported by
    /// GitHub Actions (`success`, `failure`, `cancelled`, `skipped`).
    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "passed" | "pass" | "success" => Ok(StageOutcome::Passed),
            "failed" | "fail" | "failure" => Ok(StageOutcome::Failed),
            "skipped" | "skip" => Ok(StageOutcome::Skipped),
            "not-run" | "notrun" | "cancelled" | "canceled" | "error" => Ok(StageOutcome::NotRun),
            other => bail!("Unknown stage outcome '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStage {
    pub name: String,
    pub enabled: bool,
    pub outcome: Option<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckStage {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            outcome: if enabled {
                None
            } else {
                Some(StageOutcome::Skipped)
            },
            detail: None,
        }
    }

    /// Outcome as rendered; a stage still awaiting a report shows as not run.
    pub fn effective_outcome(&self) -> StageOutcome {
        self.outcome.unwrap_or(StageOutcome::NotRun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_stage_starts_skipped() {
        let stage = CheckStage::new("lint", false);
        assert_eq!(stage.outcome, Some(StageOutcome::Skipped));

        let stage = CheckStage::new("lint", true);
        assert_eq!(stage.outcome, None);
        assert_eq!(stage.effective_outcome(), StageOutcome::NotRun);
    }

    #[test]
    fn parses_github_step_outcomes() {
        assert_eq!("success".parse::<StageOutcome>().unwrap(), StageOutcome::Passed);
        assert_eq!("failure".parse::<StageOutcome>().unwrap(), StageOutcome::Failed);
        assert_eq!("cancelled".parse::<StageOutcome>().unwrap(), StageOutcome::NotRun);
        assert_eq!("Not Run".parse::<StageOutcome>().unwrap(), StageOutcome::NotRun);
        assert!("maybe".parse::<StageOutcome>().is_err());
    }

    #[test]
    fn kind_aliases_resolve() {
        assert_eq!("fmt".parse::<StageKind>().unwrap(), StageKind::Format);
        assert_eq!("security_scan".parse::<StageKind>().unwrap(), StageKind::SecurityScan);
        assert_eq!("terraform-docs".parse::<StageKind>().unwrap(), StageKind::Docs);
        let err = "unknown".parse::<StageKind>().unwrap_err();
        assert!(err.to_string().contains("Available kinds"));
    }

    #[test]
    fn only_failed_and_not_run_fail_the_run() {
        assert!(StageOutcome::Failed.is_failure());
        assert!(StageOutcome::NotRun.is_failure());
        assert!(!StageOutcome::Passed.is_failure());
        assert!(!StageOutcome::Skipped.is_failure());
    }
}
