use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scheduler::ExecutionMode;
use crate::stage::{CheckStage, StageKind};

pub type StageParameters = Map<String, Value>;

pub const DEFAULT_CONFIG_FILE: &str = "tfgate.yaml";

/// Immutable input of one pipeline invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfiguration {
    pub version: u32,
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform_version: Option<String>,
    #[serde(default)]
    pub soft_fail: bool,
    #[serde(default)]
    pub execution: ExecutionMode,
    #[serde(default = "default_stages")]
    pub stages: Vec<StageSpec>,
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_stages() -> Vec<StageSpec> {
    StageKind::ALL.iter().map(|kind| StageSpec::builtin(*kind)).collect()
}

fn default_enabled() -> bool {
    true
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            version: 1,
            working_directory: default_working_directory(),
            terraform_version: None,
            soft_fail: false,
            execution: ExecutionMode::default(),
            stages: default_stages(),
        }
    }
}

impl RunConfiguration {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        let config: RunConfiguration = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise `tfgate.yaml` in the current
    /// directory if present, otherwise the builtin five-stage pipeline.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Result<Self> {
        if let Some(dir) = overrides.working_directory {
            self.working_directory = dir;
        }
        if let Some(version) = overrides.terraform_version {
            let version = version.trim().to_string();
            self.terraform_version = (!version.is_empty()).then_some(version);
        }
        if let Some(soft_fail) = overrides.soft_fail {
            self.soft_fail = soft_fail;
        }
        if let Some(mode) = overrides.execution {
            self.execution = mode;
        }

        let declared = self.stage_names();
        for name in &overrides.skip {
            let Some(spec) = self.stages.iter_mut().find(|spec| spec.name() == name) else {
                bail!(
                    "Cannot skip unknown stage '{}'. Declared stages: {}",
                    name,
                    declared.join(", ")
                );
            };
            if spec.kind.is_mandatory() {
                bail!("Stage '{}' is mandatory and cannot be skipped", name);
            }
            spec.enabled = false;
        }

        Ok(self)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn declared_stages(&self) -> Vec<CheckStage> {
        self.stages
            .iter()
            .map(|spec| CheckStage::new(spec.name(), spec.enabled))
            .collect()
    }

    pub fn duplicate_stage_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for spec in &self.stages {
            if !seen.insert(spec.name()) && !duplicates.iter().any(|d| d == spec.name()) {
                duplicates.push(spec.name().to_string());
            }
        }
        duplicates
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: StageKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn builtin(kind: StageKind) -> Self {
        Self {
            name: None,
            kind,
            enabled: true,
            params: None,
        }
    }

    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.kind.default_stage_name())
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_params(mut self, params: StageParameters) -> Self {
        self.params = Some(params);
        self
    }
}

/// Values supplied on the command line (or their `TFGATE_*` variables).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub working_directory: Option<PathBuf>,
    pub terraform_version: Option<String>,
    pub soft_fail: Option<bool>,
    pub execution: Option<ExecutionMode>,
    pub skip: Vec<String>,
}
