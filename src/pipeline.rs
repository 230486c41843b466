use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::aggregator::{RunResult, ValidationAggregator};
use crate::config::{RunConfiguration, StageParameters};
use crate::drift::DriftReport;
use crate::observability::MetricsCollector;
use crate::stage::{StageKind, StageOutcome};

#[derive(Debug, Clone)]
pub struct CheckContext {
    pub working_directory: PathBuf,
    pub terraform_version: Option<String>,
}

impl CheckContext {
    pub fn from_config(config: &RunConfiguration) -> Self {
        Self {
            working_directory: config.working_directory.clone(),
            terraform_version: config.terraform_version.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub outcome: StageOutcome,
    pub detail: Option<String>,
    pub drift: Option<DocsDrift>,
}

impl CheckReport {
    pub fn passed(detail: impl Into<Option<String>>) -> Self {
        Self {
            outcome: StageOutcome::Passed,
            detail: detail.into(),
            drift: None,
        }
    }

    pub fn failed(detail: impl Into<Option<String>>) -> Self {
        Self {
            outcome: StageOutcome::Failed,
            detail: detail.into(),
            drift: None,
        }
    }

    pub fn not_run(detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::NotRun,
            detail: Some(detail.into()),
            drift: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocsDrift {
    pub stage: String,
    pub output_file: PathBuf,
    pub report: DriftReport,
}

/// A collaborator that runs one external tool and reports pass or fail.
///
/// Returning `Err` means the tool could not start or finish; the stage is
/// then recorded as `NotRun` rather than `Failed`.
pub trait Check: Send + Sync {
    fn kind(&self) -> StageKind;
    fn run(&self, ctx: &CheckContext) -> Result<CheckReport>;
}

type CheckConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Check>> + Send + Sync>;

pub struct CheckRegistry {
    factories: HashMap<String, CheckConstructor>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: StageKind, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Check>> + Send + Sync + 'static,
    {
        self.factories
            .insert(kind.as_str().to_string(), Arc::new(constructor));
    }

    pub fn create(&self, kind: StageKind, params: StageParameters) -> Result<Box<dyn Check>> {
        let factory = self.factories.get(kind.as_str()).ok_or_else(|| {
            anyhow!(
                "No check registered for stage kind '{}'. Available kinds: {}",
                kind,
                self.known_checks().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_checks(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

struct PlannedStage {
    name: String,
    check: Option<Box<dyn Check>>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub result: RunResult,
    pub drift: Vec<DocsDrift>,
}

pub struct PipelineExecutor {
    config: RunConfiguration,
    stages: Vec<PlannedStage>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn execute(&self) -> Result<PipelineOutput> {
        self.metrics.reset();
        let total_start = Instant::now();
        let ctx = CheckContext::from_config(&self.config);
        let mut aggregator = ValidationAggregator::new(&self.config)?;

        let runnable: Vec<(&str, &dyn Check)> = self
            .stages
            .iter()
            .filter_map(|stage| stage.check.as_deref().map(|check| (stage.name.as_str(), check)))
            .collect();

        for stage in self.stages.iter().filter(|s| s.check.is_none()) {
            info!(stage = %stage.name, "Skipping disabled stage");
            self.metrics.record_outcome(&stage.name, StageOutcome::Skipped);
        }

        // All checks finish before anything is recorded, in declaration order.
        let reports: Vec<(&str, Result<CheckReport>)> = if self.config.execution.is_parallel() {
            thread::scope(|scope| {
                let handles: Vec<_> = runnable
                    .iter()
                    .map(|(name, check)| {
                        let ctx = &ctx;
                        (*name, scope.spawn(move || self.run_stage(name, *check, ctx)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(name, handle)| {
                        let report = handle
                            .join()
                            .unwrap_or_else(|_| Err(anyhow!("check panicked")));
                        (name, report)
                    })
                    .collect()
            })
        } else {
            runnable
                .iter()
                .map(|(name, check)| (*name, self.run_stage(name, *check, &ctx)))
                .collect()
        };

        let mut drift = Vec::new();
        for (name, report) in reports {
            match report {
                Ok(report) => {
                    self.metrics.record_outcome(name, report.outcome);
                    if let Some(mut found) = report.drift {
                        found.stage = name.to_string();
                        drift.push(found);
                    }
                    aggregator.record_outcome(name, report.outcome, report.detail)?;
                }
                Err(err) => {
                    warn!(stage = name, error = %format!("{err:#}"), "Stage could not run");
                    self.metrics.record_outcome(name, StageOutcome::NotRun);
                    aggregator.mark_not_run(name, format!("{err:#}"))?;
                }
            }
        }

        let result = aggregator.finalize();
        self.metrics.record_total_duration(total_start.elapsed());
        self.metrics.record_verdict(result.overall_failed);

        info!(
            overall_failed = result.overall_failed,
            exit_code = result.exit_code,
            soft_fail = result.soft_fail,
            "Pipeline finished"
        );

        Ok(PipelineOutput { result, drift })
    }

    #[instrument(skip(self, check, ctx), fields(kind = %check.kind()))]
    fn run_stage(&self, name: &str, check: &dyn Check, ctx: &CheckContext) -> Result<CheckReport> {
        let _timer = self.metrics.start_stage(name);
        info!("Running stage");
        let report = check.run(ctx)?;
        match report.outcome {
            StageOutcome::Passed => info!(detail = ?report.detail, "Stage passed"),
            StageOutcome::Failed => warn!(detail = ?report.detail, "Stage failed"),
            _ => warn!(outcome = %report.outcome, detail = ?report.detail, "Stage did not complete"),
        }
        Ok(report)
    }
}

pub fn build_pipeline(
    registry: &CheckRegistry,
    config: RunConfiguration,
) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(config.stages.len());
    for spec in &config.stages {
        let check = if spec.enabled {
            let params = spec.params.clone().unwrap_or_default();
            let check = registry
                .create(spec.kind, params)
                .map_err(|err| err.context(format!("Stage '{}'", spec.name())))?;
            Some(check)
        } else {
            None
        };
        stages.push(PlannedStage {
            name: spec.name().to_string(),
            check,
        });
    }

    Ok(PipelineExecutor {
        config,
        stages,
        metrics: MetricsCollector::new(),
    })
}
