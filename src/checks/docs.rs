use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use super::process::run_tool;
use super::{reject_unknown, take_bool, take_string, take_string_list, take_u64};
use crate::config::StageParameters;
use crate::drift::detect_drift;
use crate::pipeline::{Check, CheckContext, CheckReport, DocsDrift};
use crate::stage::StageKind;

const DEFAULT_OUTPUT_FILE: &str = "README.md";

/// Regenerates module documentation in place and fails when the result
/// differs from what was committed.
pub struct DocsDriftCheck {
    command: Vec<String>,
    output_file: PathBuf,
    normalize_whitespace: bool,
    timeout: Option<Duration>,
}

impl DocsDriftCheck {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let output_file = take_string(&mut params, "output_file")
            .filter(|f| !f.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_FILE));
        let command = match take_string_list(&mut params, "command")? {
            Some(command) if !command.is_empty() => command,
            Some(_) => bail!("docs stage 'command' parameter cannot be empty"),
            None => default_command(&output_file),
        };
        let normalize_whitespace = take_bool(&mut params, "normalize_whitespace")?.unwrap_or(false);
        let timeout = take_u64(&mut params, "timeout_secs")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        reject_unknown(StageKind::Docs, &params)?;

        Ok(Self {
            command,
            output_file,
            normalize_whitespace,
            timeout,
        })
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }
}

impl Check for DocsDriftCheck {
    fn kind(&self) -> StageKind {
        StageKind::Docs
    }

    fn run(&self, ctx: &CheckContext) -> Result<CheckReport> {
        let target = ctx.working_directory.join(&self.output_file);
        let previous = read_optional(&target)?;

        let output = run_tool(&self.command, &ctx.working_directory, self.timeout)?;
        match output.code() {
            Some(0) => {}
            Some(code) => {
                return Ok(CheckReport::failed(format!(
                    "documentation generator exited with code {code}"
                )));
            }
            None => {
                return Ok(CheckReport::not_run(
                    "documentation generator terminated without an exit code",
                ));
            }
        }

        let regenerated = read_optional(&target)?.unwrap_or_default();
        let report = detect_drift(previous.as_deref(), &regenerated, self.normalize_whitespace);
        info!(
            file = %target.display(),
            drifted = report.drifted,
            changed_lines = report.changed_lines,
            "Documentation compared"
        );

        if report.drifted {
            let mut check_report = CheckReport::failed(report.detail());
            check_report.drift = Some(DocsDrift {
                stage: StageKind::Docs.default_stage_name().to_string(),
                output_file: self.output_file.clone(),
                report,
            });
            Ok(check_report)
        } else {
            Ok(CheckReport::passed(report.detail()))
        }
    }
}

fn default_command(output_file: &Path) -> Vec<String> {
    vec![
        "terraform-docs".to_string(),
        "markdown".to_string(),
        "table".to_string(),
        "--output-file".to_string(),
        output_file.to_string_lossy().to_string(),
        "--output-mode".to_string(),
        "inject".to_string(),
        ".".to_string(),
    ]
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to read documentation: {}", path.display()))
        }
    }
}
