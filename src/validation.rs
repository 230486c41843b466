use anyhow::Result;
use serde::Serialize;

use crate::config::{RunConfiguration, StageSpec};
use crate::pipeline::CheckRegistry;
use crate::stage::StageKind;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &RunConfiguration, registry: &CheckRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != 1 {
        report
            .errors
            .push(format!("Unsupported configuration version: {}", config.version));
    }

    if config.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    for name in config.duplicate_stage_names() {
        report
            .errors
            .push(format!("Stage name '{name}' is declared more than once"));
    }

    let format_stages: Vec<&StageSpec> = config
        .stages
        .iter()
        .filter(|spec| spec.kind == StageKind::Format)
        .collect();
    if format_stages.is_empty() {
        report
            .errors
            .push("A format stage is required".into());
    } else if format_stages.iter().any(|spec| !spec.enabled) {
        report
            .errors
            .push("The format stage is mandatory and cannot be disabled".into());
    }

    if config.working_directory.as_os_str().is_empty() {
        report
            .errors
            .push("Working directory cannot be empty".into());
    } else {
        report.merge(validate_working_directory(config));
    }

    for (idx, spec) in config.stages.iter().enumerate() {
        report.merge(validate_stage(idx, spec, registry));
    }

    report
}

fn validate_stage(idx: usize, spec: &StageSpec, registry: &CheckRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if spec.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        report
            .errors
            .push(format!("Stage {} has an empty name", idx + 1));
    }

    let params = spec.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(spec.kind, params) {
        report.errors.push(format!(
            "Stage {} ('{}'): {:#}",
            idx + 1,
            spec.name(),
            err.context("Failed to instantiate check")
        ));
    }

    report
}

fn validate_working_directory(config: &RunConfiguration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let dir = &config.working_directory;

    if !dir.is_dir() {
        report.warnings.push(format!(
            "Working directory '{}' does not exist on this machine",
            dir.display()
        ));
        return report;
    }

    match count_terraform_files(dir) {
        Ok(0) => report.warnings.push(format!(
            "No *.tf files found under '{}'",
            dir.display()
        )),
        Ok(_) => {}
        Err(err) => report
            .warnings
            .push(format!("Could not scan '{}': {err:#}", dir.display())),
    }

    report
}

fn count_terraform_files(dir: &std::path::Path) -> Result<usize> {
    let pattern = dir.join("**").join("*.tf");
    let pattern = pattern.to_string_lossy();
    let count = glob::glob(&pattern)?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .count();
    Ok(count)
}
