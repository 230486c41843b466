use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::{RunResult, exit_code, overall_failed};
use crate::stage::CheckStage;

const STAGE_HEADER: &str = "Stage";
const STATUS_HEADER: &str = "Status";
const DETAIL_HEADER: &str = "Detail";

/// Renders the run as a plain-text table followed by the verdict and the
/// configuration footer. Output depends only on `result`.
pub fn render(result: &RunResult) -> String {
    let statuses: Vec<String> = result.stages.iter().map(status_cell).collect();
    let name_width = result
        .stages
        .iter()
        .map(|s| s.name.chars().count())
        .chain(std::iter::once(STAGE_HEADER.len()))
        .max()
        .unwrap_or(STAGE_HEADER.len());
    let status_width = statuses
        .iter()
        .map(|s| s.chars().count())
        .chain(std::iter::once(STATUS_HEADER.len()))
        .max()
        .unwrap_or(STATUS_HEADER.len());

    let mut output = String::new();
    output.push_str(
        format!(
            "{:<name_width$}  {:<status_width$}  {}",
            STAGE_HEADER, STATUS_HEADER, DETAIL_HEADER
        )
        .trim_end(),
    );
    output.push('\n');
    output.push_str(&format!(
        "{}  {}  {}\n",
        "-".repeat(name_width),
        "-".repeat(status_width),
        "-".repeat(DETAIL_HEADER.len())
    ));

    for (stage, status) in result.stages.iter().zip(&statuses) {
        let line = format!(
            "{:<name_width$}  {:<status_width$}  {}",
            stage.name,
            status,
            stage.detail.as_deref().unwrap_or("")
        );
        output.push_str(line.trim_end());
        output.push('\n');
    }

    output.push('\n');
    output.push_str(&format!("Result: {}\n", verdict(result)));
    output.push_str(&format!("Configuration: {}\n", footer(result)));
    output
}

pub fn render_markdown(result: &RunResult) -> String {
    let mut output = String::new();
    output.push_str("## Terraform validation\n\n");
    output.push_str("| Stage | Status | Detail |\n");
    output.push_str("| --- | --- | --- |\n");
    for stage in &result.stages {
        output.push_str(&format!(
            "| {} | {} | {} |\n",
            escape_cell(&stage.name),
            status_cell(stage),
            escape_cell(stage.detail.as_deref().unwrap_or(""))
        ));
    }
    output.push('\n');
    output.push_str(&format!("**Result:** {}\n\n", verdict(result)));
    output.push_str(&format!("_{}_\n", footer(result)));
    output
}

fn status_cell(stage: &CheckStage) -> String {
    let outcome = stage.effective_outcome();
    format!("{} {}", outcome.glyph(), outcome.label())
}

fn verdict(result: &RunResult) -> String {
    if !result.overall_failed {
        "PASSED".to_string()
    } else if result.soft_fail {
        format!(
            "FAILED (soft-fail: exit {}, {} stage(s) need attention)",
            result.exit_code,
            result.failed_stages().len()
        )
    } else {
        format!(
            "FAILED ({} stage(s) need attention)",
            result.failed_stages().len()
        )
    }
}

fn footer(result: &RunResult) -> String {
    format!(
        "directory={} terraform={} soft-fail={}",
        result.working_directory.display(),
        result.terraform_version.as_deref().unwrap_or("any"),
        result.soft_fail
    )
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonReport {
    pub tool: String,
    pub tool_version: String,
    pub generated_at: DateTime<Utc>,
    pub result: RunResult,
}

pub fn write_json(result: &RunResult, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let report = JsonReport {
        tool: env!("CARGO_PKG_NAME").to_string(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: Utc::now(),
        result: result.clone(),
    };
    let file = File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, &report)
        .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
    Ok(())
}

pub fn read_json(path: &Path) -> Result<RunResult> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read report file: {}", path.display()))?;
    let report: JsonReport = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse report JSON: {}", path.display()))?;

    // The verdict is derived from the rows, never trusted from the file.
    let mut result = report.result;
    result.overall_failed = overall_failed(&result.stages);
    result.exit_code = exit_code(result.overall_failed, result.soft_fail);
    Ok(result)
}

/// Appends the markdown summary; step summary files are shared by every step of a job.
pub fn append_markdown(result: &RunResult, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open summary file: {}", path.display()))?;
    file.write_all(render_markdown(result).as_bytes())
        .with_context(|| format!("Failed to write summary: {}", path.display()))?;
    Ok(())
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
