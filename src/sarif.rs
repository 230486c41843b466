use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

/// Number of results across all runs of a SARIF log.
pub fn count_findings(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read SARIF file: {}", path.display()))?;
    let document: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse SARIF JSON: {}", path.display()))?;
    count_in_document(&document)
        .with_context(|| format!("Invalid SARIF document: {}", path.display()))
}

fn count_in_document(document: &Value) -> Result<usize> {
    let Some(runs) = document.get("runs").and_then(Value::as_array) else {
        bail!("missing 'runs' array");
    };
    Ok(runs
        .iter()
        .filter_map(|run| run.get("results").and_then(Value::as_array))
        .map(Vec::len)
        .sum())
}

pub fn findings_detail(count: usize) -> String {
    match count {
        0 => "no findings".to_string(),
        1 => "1 finding".to_string(),
        n => format!("{n} findings"),
    }
}
