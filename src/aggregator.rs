use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunConfiguration;
use crate::stage::{CheckStage, StageOutcome};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

const UNREPORTED_DETAIL: &str = "no outcome reported";

/// Integration errors raised when a collaborator breaks the reporting contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    #[error("stage '{stage}' is not declared in this run")]
    UnknownStage { stage: String },

    #[error("stage '{stage}' is declared more than once")]
    DuplicateStageName { stage: String },

    #[error("stage '{stage}' already reported '{previous}' in this run")]
    DuplicateStageReport {
        stage: String,
        previous: StageOutcome,
    },

    #[error("stage '{stage}' is disabled and must not report an outcome")]
    StageDisabledViolation { stage: String },

    #[error("stage '{stage}' cannot report 'skipped'; skipping follows from its enabled flag")]
    SkippedNotReportable { stage: String },
}

#[derive(Debug, Clone)]
pub struct ValidationAggregator {
    stages: Vec<CheckStage>,
    soft_fail: bool,
    working_directory: PathBuf,
    terraform_version: Option<String>,
}

impl ValidationAggregator {
    pub fn new(config: &RunConfiguration) -> Result<Self, AggregatorError> {
        if let Some(stage) = config.duplicate_stage_names().into_iter().next() {
            return Err(AggregatorError::DuplicateStageName { stage });
        }

        Ok(Self {
            stages: config.declared_stages(),
            soft_fail: config.soft_fail,
            working_directory: config.working_directory.clone(),
            terraform_version: config.terraform_version.clone(),
        })
    }

    /// Stores the outcome a collaborator observed for `stage`.
    ///
    /// Each enabled stage reports exactly once. Disabled stages never report.
    pub fn record_outcome(
        &mut self,
        stage: &str,
        outcome: StageOutcome,
        detail: Option<String>,
    ) -> Result<(), AggregatorError> {
        let entry = self
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .ok_or_else(|| AggregatorError::UnknownStage {
                stage: stage.to_string(),
            })?;

        if !entry.enabled {
            return Err(AggregatorError::StageDisabledViolation {
                stage: stage.to_string(),
            });
        }
        if outcome == StageOutcome::Skipped {
            return Err(AggregatorError::SkippedNotReportable {
                stage: stage.to_string(),
            });
        }
        if let Some(previous) = entry.outcome {
            return Err(AggregatorError::DuplicateStageReport {
                stage: stage.to_string(),
                previous,
            });
        }

        entry.outcome = Some(outcome);
        entry.detail = detail.filter(|d| !d.trim().is_empty());
        Ok(())
    }

    pub fn mark_not_run(
        &mut self,
        stage: &str,
        detail: impl Into<String>,
    ) -> Result<(), AggregatorError> {
        self.record_outcome(stage, StageOutcome::NotRun, Some(detail.into()))
    }

    pub fn pending(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.enabled && s.outcome.is_none())
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.pending().is_empty()
    }

    /// Computes the verdict. Enabled stages that never reported count as `NotRun`.
    pub fn finalize(&self) -> RunResult {
        let stages: Vec<CheckStage> = self
            .stages
            .iter()
            .cloned()
            .map(|mut stage| {
                if stage.enabled && stage.outcome.is_none() {
                    stage.outcome = Some(StageOutcome::NotRun);
                    stage.detail = Some(UNREPORTED_DETAIL.to_string());
                }
                stage
            })
            .collect();

        let overall_failed = overall_failed(&stages);
        RunResult {
            exit_code: exit_code(overall_failed, self.soft_fail),
            overall_failed,
            soft_fail: self.soft_fail,
            working_directory: self.working_directory.clone(),
            terraform_version: self.terraform_version.clone(),
            stages,
        }
    }
}

/// True when any enabled stage failed or never ran.
pub fn overall_failed(stages: &[CheckStage]) -> bool {
    stages
        .iter()
        .filter(|s| s.enabled)
        .any(|s| s.effective_outcome().is_failure())
}

pub fn exit_code(overall_failed: bool, soft_fail: bool) -> i32 {
    if overall_failed && !soft_fail {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub stages: Vec<CheckStage>,
    pub overall_failed: bool,
    pub exit_code: i32,
    pub soft_fail: bool,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform_version: Option<String>,
}

impl RunResult {
    pub fn stage(&self, name: &str) -> Option<&CheckStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn count(&self, outcome: StageOutcome) -> usize {
        self.stages
            .iter()
            .filter(|s| s.effective_outcome() == outcome)
            .count()
    }

    pub fn failed_stages(&self) -> Vec<&CheckStage> {
        self.stages
            .iter()
            .filter(|s| s.enabled && s.effective_outcome().is_failure())
            .collect()
    }

    /// Failed but let through by soft-fail.
    pub fn is_soft_failed(&self) -> bool {
        self.overall_failed && self.exit_code == EXIT_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSpec;
    use crate::stage::StageKind;

    fn config(soft_fail: bool, disabled: &[StageKind]) -> RunConfiguration {
        let mut config = RunConfiguration {
            soft_fail,
            ..RunConfiguration::default()
        };
        for spec in &mut config.stages {
            if disabled.contains(&spec.kind) {
                spec.enabled = false;
            }
        }
        config
    }

    fn report_all(aggregator: &mut ValidationAggregator, outcomes: &[(&str, StageOutcome)]) {
        for (name, outcome) in outcomes {
            aggregator.record_outcome(name, *outcome, None).unwrap();
        }
    }

    #[test]
    fn all_disabled_but_format_reported_passes() {
        let config = config(
            false,
            &[
                StageKind::Lint,
                StageKind::SecurityScan,
                StageKind::PolicyScan,
                StageKind::Docs,
            ],
        );
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        aggregator
            .record_outcome("format", StageOutcome::Passed, None)
            .unwrap();
        let result = aggregator.finalize();
        assert!(!result.overall_failed);
        assert_eq!(result.exit_code, EXIT_SUCCESS);
        assert_eq!(result.count(StageOutcome::Skipped), 4);
    }

    #[test]
    fn no_enabled_stages_never_fails() {
        let mut config = RunConfiguration::default();
        for spec in &mut config.stages {
            spec.enabled = false;
        }
        for soft_fail in [false, true] {
            config.soft_fail = soft_fail;
            let result = ValidationAggregator::new(&config).unwrap().finalize();
            assert!(!result.overall_failed);
            assert_eq!(result.exit_code, EXIT_SUCCESS);
        }

        let empty = RunConfiguration {
            stages: Vec::new(),
            ..RunConfiguration::default()
        };
        let result = ValidationAggregator::new(&empty).unwrap().finalize();
        assert!(result.stages.is_empty());
        assert!(!result.overall_failed);
    }

    #[test]
    fn exit_code_table() {
        assert_eq!(exit_code(false, false), EXIT_SUCCESS);
        assert_eq!(exit_code(false, true), EXIT_SUCCESS);
        assert_eq!(exit_code(true, false), EXIT_FAILURE);
        assert_eq!(exit_code(true, true), EXIT_SUCCESS);
    }

    #[test]
    fn hard_failure_blocks_and_soft_failure_warns() {
        for (soft_fail, expected_exit) in [(false, EXIT_FAILURE), (true, EXIT_SUCCESS)] {
            let config = config(soft_fail, &[StageKind::SecurityScan]);
            let mut aggregator = ValidationAggregator::new(&config).unwrap();
            report_all(
                &mut aggregator,
                &[
                    ("format", StageOutcome::Passed),
                    ("lint", StageOutcome::Failed),
                    ("policy-scan", StageOutcome::Passed),
                    ("docs-drift", StageOutcome::Passed),
                ],
            );
            let result = aggregator.finalize();
            assert!(result.overall_failed);
            assert_eq!(result.exit_code, expected_exit);
            assert_eq!(result.is_soft_failed(), soft_fail);
            assert_eq!(
                result.stage("lint").unwrap().outcome,
                Some(StageOutcome::Failed)
            );
            assert_eq!(
                result.stage("security-scan").unwrap().outcome,
                Some(StageOutcome::Skipped)
            );
        }
    }

    #[test]
    fn not_run_counts_as_failure() {
        let config = config(false, &[StageKind::Lint]);
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        aggregator
            .mark_not_run("format", "terraform binary not found")
            .unwrap();
        report_all(
            &mut aggregator,
            &[
                ("security-scan", StageOutcome::Passed),
                ("policy-scan", StageOutcome::Passed),
                ("docs-drift", StageOutcome::Passed),
            ],
        );
        let result = aggregator.finalize();
        assert!(result.overall_failed);
        assert_eq!(result.exit_code, EXIT_FAILURE);
        let format = result.stage("format").unwrap();
        assert_eq!(format.outcome, Some(StageOutcome::NotRun));
        assert_eq!(format.detail.as_deref(), Some("terraform binary not found"));
    }

    #[test]
    fn unreported_enabled_stage_finalizes_as_not_run() {
        let config = config(false, &[]);
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        aggregator
            .record_outcome("format", StageOutcome::Passed, None)
            .unwrap();
        assert_eq!(
            aggregator.pending(),
            vec!["lint", "security-scan", "policy-scan", "docs-drift"]
        );
        assert!(!aggregator.is_complete());

        let result = aggregator.finalize();
        let lint = result.stage("lint").unwrap();
        assert_eq!(lint.outcome, Some(StageOutcome::NotRun));
        assert_eq!(lint.detail.as_deref(), Some(UNREPORTED_DETAIL));
        assert_eq!(result.exit_code, EXIT_FAILURE);
    }

    #[test]
    fn duplicate_report_is_rejected() {
        let config = config(false, &[]);
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        aggregator
            .record_outcome("lint", StageOutcome::Passed, None)
            .unwrap();
        let err = aggregator
            .record_outcome("lint", StageOutcome::Passed, None)
            .unwrap_err();
        assert_eq!(
            err,
            AggregatorError::DuplicateStageReport {
                stage: "lint".into(),
                previous: StageOutcome::Passed,
            }
        );
    }

    #[test]
    fn disabled_stage_cannot_report() {
        let config = config(false, &[StageKind::Docs]);
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        for outcome in [
            StageOutcome::Passed,
            StageOutcome::Failed,
            StageOutcome::NotRun,
            StageOutcome::Skipped,
        ] {
            let err = aggregator
                .record_outcome("docs-drift", outcome, None)
                .unwrap_err();
            assert!(matches!(err, AggregatorError::StageDisabledViolation { .. }));
        }
        let result = aggregator.finalize();
        assert_eq!(
            result.stage("docs-drift").unwrap().outcome,
            Some(StageOutcome::Skipped)
        );
    }

    #[test]
    fn enabled_stage_cannot_report_skipped_or_unknown() {
        let config = config(false, &[]);
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        let err = aggregator
            .record_outcome("lint", StageOutcome::Skipped, None)
            .unwrap_err();
        assert!(matches!(err, AggregatorError::SkippedNotReportable { .. }));
        assert!(aggregator.pending().contains(&"lint"));

        let err = aggregator
            .record_outcome("coverage", StageOutcome::Passed, None)
            .unwrap_err();
        assert!(matches!(err, AggregatorError::UnknownStage { .. }));
    }

    #[test]
    fn report_order_does_not_change_verdict() {
        let outcomes = [
            ("format", StageOutcome::Passed),
            ("lint", StageOutcome::Failed),
            ("security-scan", StageOutcome::Passed),
            ("policy-scan", StageOutcome::NotRun),
            ("docs-drift", StageOutcome::Passed),
        ];
        let config = config(false, &[]);

        let mut forward = ValidationAggregator::new(&config).unwrap();
        report_all(&mut forward, &outcomes);
        let mut reversed_outcomes = outcomes;
        reversed_outcomes.reverse();
        let mut backward = ValidationAggregator::new(&config).unwrap();
        report_all(&mut backward, &reversed_outcomes);

        let a = forward.finalize();
        let b = backward.finalize();
        assert_eq!(a, b);
        let names: Vec<_> = b.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["format", "lint", "security-scan", "policy-scan", "docs-drift"]
        );
    }

    #[test]
    fn duplicate_declarations_are_refused() {
        let mut config = RunConfiguration::default();
        config.stages.push(StageSpec::builtin(StageKind::Lint));
        let err = ValidationAggregator::new(&config).unwrap_err();
        assert_eq!(
            err,
            AggregatorError::DuplicateStageName {
                stage: "lint".into()
            }
        );
    }

    #[test]
    fn blank_detail_is_dropped() {
        let config = config(false, &[]);
        let mut aggregator = ValidationAggregator::new(&config).unwrap();
        aggregator
            .record_outcome("format", StageOutcome::Passed, Some("  ".into()))
            .unwrap();
        assert_eq!(aggregator.finalize().stage("format").unwrap().detail, None);
    }
}
