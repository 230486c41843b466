use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};

use crate::config::{RunConfiguration, StageParameters, StageSpec};
use crate::report::ensure_parent;
use crate::scheduler::ExecutionMode;
use crate::stage::StageKind;

pub const PRESETS: [&str; 3] = ["standard", "strict", "minimal"];

/// Writes a starter configuration. Refuses to overwrite an existing file.
pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let config = preset(name)?;

    if destination.exists() {
        bail!(
            "Refusing to overwrite existing configuration: {}",
            destination.display()
        );
    }

    let rendered = serde_yaml::to_string(&config)?;
    ensure_parent(destination)?;
    fs::write(destination, rendered).with_context(|| {
        format!("Failed to write configuration: {}", destination.display())
    })?;

    Ok(destination.to_path_buf())
}

pub fn preset(name: &str) -> Result<RunConfiguration> {
    match name {
        "standard" => Ok(standard_preset()),
        "strict" => Ok(strict_preset()),
        "minimal" => Ok(minimal_preset()),
        other => bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

fn standard_preset() -> RunConfiguration {
    RunConfiguration::default()
}

fn strict_preset() -> RunConfiguration {
    RunConfiguration {
        execution: ExecutionMode::Parallel,
        stages: vec![
            StageSpec::builtin(StageKind::Format),
            StageSpec::builtin(StageKind::Lint)
                .with_params(params([("sarif_output", "reports/tflint.sarif")])),
            StageSpec::builtin(StageKind::SecurityScan)
                .with_params(params([("sarif_output", "reports/tfsec.sarif")])),
            StageSpec::builtin(StageKind::PolicyScan)
                .with_params(params([("sarif_output", "reports/checkov.sarif")])),
            StageSpec::builtin(StageKind::Docs),
        ],
        ..RunConfiguration::default()
    }
}

fn minimal_preset() -> RunConfiguration {
    RunConfiguration {
        soft_fail: true,
        stages: vec![
            StageSpec::builtin(StageKind::Format),
            StageSpec::builtin(StageKind::Lint),
            StageSpec::builtin(StageKind::SecurityScan).disabled(),
            StageSpec::builtin(StageKind::PolicyScan).disabled(),
            StageSpec::builtin(StageKind::Docs)
                .with_params(params([("normalize_whitespace", Value::Bool(true))])),
        ],
        ..RunConfiguration::default()
    }
}

fn params<V, const N: usize>(entries: [(&str, V); N]) -> StageParameters
where
    V: Into<Value>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.into()))
        .collect::<Map<String, Value>>()
}
