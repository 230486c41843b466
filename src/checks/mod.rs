use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::StageParameters;
use crate::pipeline::{Check, CheckContext, CheckRegistry, CheckReport};
use crate::report::ensure_parent;
use crate::sarif::{count_findings, findings_detail};
use crate::stage::StageKind;

mod docs;
pub mod process;

pub use docs::DocsDriftCheck;
use process::{ToolOutput, run_tool};

pub fn register_defaults(registry: &mut CheckRegistry) {
    for kind in [
        StageKind::Format,
        StageKind::Lint,
        StageKind::SecurityScan,
        StageKind::PolicyScan,
    ] {
        registry.register(kind, move |params| {
            Ok(Box::new(CommandCheck::from_params(kind, params)?))
        });
    }
    registry.register(StageKind::Docs, |params| {
        Ok(Box::new(DocsDriftCheck::from_params(params)?))
    });
}

/// A stage whose verdict is the exit status of one external tool.
pub struct CommandCheck {
    kind: StageKind,
    command: Vec<String>,
    sarif_output: Option<PathBuf>,
    timeout: Option<Duration>,
    version_command: Vec<String>,
}

impl CommandCheck {
    pub fn from_params(kind: StageKind, mut params: StageParameters) -> Result<Self> {
        let mut command = match take_string_list(&mut params, "command")? {
            Some(command) if command.is_empty() => {
                bail!("{} stage 'command' parameter cannot be empty", kind)
            }
            Some(command) => command,
            None => default_command(kind),
        };
        if let Some(extra) = take_string_list(&mut params, "args")? {
            command.extend(extra);
        }

        let sarif_output = take_string(&mut params, "sarif_output").map(PathBuf::from);
        if sarif_output.is_some() && sarif_args(kind).is_none() {
            bail!("{} stage does not produce SARIF output", kind);
        }

        let timeout = take_u64(&mut params, "timeout_secs")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let version_command = take_string_list(&mut params, "version_command")?
            .unwrap_or_else(|| vec!["terraform".to_string(), "version".to_string()]);

        reject_unknown(kind, &params)?;

        Ok(Self {
            kind,
            command,
            sarif_output,
            timeout,
            version_command,
        })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// `Some(report)` when the installed terraform does not match the pin.
    fn check_toolchain(&self, ctx: &CheckContext) -> Result<Option<CheckReport>> {
        let Some(required) = ctx.terraform_version.as_deref() else {
            return Ok(None);
        };
        if self.kind != StageKind::Format {
            return Ok(None);
        }

        let output = run_tool(&self.version_command, &ctx.working_directory, self.timeout)?;
        let reported = output.stdout.lines().next().unwrap_or("").trim().to_string();
        if output.status.success() && version_matches(&reported, required) {
            debug!(required, reported = %reported, "Toolchain version matches");
            return Ok(None);
        }

        Ok(Some(CheckReport::not_run(format!(
            "terraform {} required, found '{}'",
            required,
            if reported.is_empty() { "unknown" } else { reported.as_str() }
        ))))
    }

    fn failure_detail(&self, output: &ToolOutput) -> String {
        let code = output.code().unwrap_or(-1);
        if self.kind == StageKind::Format {
            let files = output
                .stdout
                .lines()
                .filter(|line| !line.trim().is_empty())
                .count();
            if files > 0 {
                return format!("{files} file(s) need formatting");
            }
        }
        match first_line(&output.stderr) {
            Some(line) => format!("exit code {code}: {line}"),
            None => format!("exit code {code}"),
        }
    }

    fn sarif_detail(&self, path: &Path, output: &ToolOutput) -> Option<String> {
        let write = ensure_parent(path).and_then(|_| {
            fs::write(path, &output.stdout)
                .with_context(|| format!("Failed to write SARIF file: {}", path.display()))
        });
        if let Err(err) = write {
            warn!(stage = %self.kind, error = %format!("{err:#}"), "SARIF output not saved");
            return None;
        }
        match count_findings(path) {
            Ok(count) => Some(findings_detail(count)),
            Err(err) => {
                warn!(stage = %self.kind, error = %format!("{err:#}"), "SARIF output unreadable");
                None
            }
        }
    }
}

impl Check for CommandCheck {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn run(&self, ctx: &CheckContext) -> Result<CheckReport> {
        if let Some(report) = self.check_toolchain(ctx)? {
            return Ok(report);
        }

        let mut argv = self.command.clone();
        if self.sarif_output.is_some()
            && let Some(extra) = sarif_args(self.kind)
        {
            argv.extend(extra.iter().map(|s| s.to_string()));
        }

        let output = run_tool(&argv, &ctx.working_directory, self.timeout)?;
        let Some(code) = output.code() else {
            return Ok(CheckReport::not_run(format!(
                "{} terminated without an exit code",
                argv[0]
            )));
        };

        let findings = self
            .sarif_output
            .as_ref()
            .and_then(|path| self.sarif_detail(path, &output));

        if code == 0 {
            Ok(CheckReport::passed(findings))
        } else {
            Ok(CheckReport::failed(
                findings.unwrap_or_else(|| self.failure_detail(&output)),
            ))
        }
    }
}

fn default_command(kind: StageKind) -> Vec<String> {
    let argv: &[&str] = match kind {
        StageKind::Format => &["terraform", "fmt", "-check", "-recursive"],
        StageKind::Lint => &["tflint", "--recursive"],
        StageKind::SecurityScan => &["tfsec", "."],
        StageKind::PolicyScan => &["checkov", "-d", ".", "--quiet"],
        StageKind::Docs => &["terraform-docs", "markdown", "table", "."],
    };
    argv.iter().map(|s| s.to_string()).collect()
}

fn sarif_args(kind: StageKind) -> Option<&'static [&'static str]> {
    match kind {
        StageKind::Lint => Some(&["--format", "sarif"]),
        StageKind::SecurityScan => Some(&["--format", "sarif"]),
        StageKind::PolicyScan => Some(&["--output", "sarif"]),
        StageKind::Format | StageKind::Docs => None,
    }
}

/// `terraform version` prints `Terraform v1.6.6`; the pin may omit the `v`.
fn version_matches(reported: &str, required: &str) -> bool {
    let required = required.trim().trim_start_matches('v');
    reported
        .split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .any(|token| token == required)
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

pub(crate) fn reject_unknown(kind: StageKind, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<&str> = params.keys().map(String::as_str).collect();
    keys.sort_unstable();
    Err(anyhow!(
        "Unknown parameter(s) for {} stage: {}",
        kind,
        keys.join(", ")
    ))
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub(crate) fn take_bool(params: &mut StageParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => bail!("Parameter '{key}' must be a boolean, got '{s}'"),
        },
        Some(other) => bail!("Parameter '{key}' must be a boolean, got {other}"),
    }
}

pub(crate) fn take_u64(params: &mut StageParameters, key: &str) -> Result<Option<u64>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => num
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("Parameter '{key}' must be a non-negative integer")),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .with_context(|| format!("Parameter '{key}' must be a non-negative integer")),
        Some(other) => bail!("Parameter '{key}' must be a non-negative integer, got {other}"),
    }
}

/// Accepts a YAML list of strings or a single whitespace-separated string.
pub(crate) fn take_string_list(
    params: &mut StageParameters,
    key: &str,
) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.split_whitespace().map(str::to_string).collect())),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(anyhow!("Parameter '{key}' entries must be strings, got {other}")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => bail!("Parameter '{key}' must be a list of strings, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn params(value: Value) -> StageParameters {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn ctx(dir: &std::path::Path) -> CheckContext {
        CheckContext {
            working_directory: dir.to_path_buf(),
            terraform_version: None,
        }
    }

    #[test]
    fn defaults_follow_kind() {
        let check = CommandCheck::from_params(StageKind::Format, StageParameters::new()).unwrap();
        assert_eq!(check.command(), ["terraform", "fmt", "-check", "-recursive"]);

        let check = CommandCheck::from_params(
            StageKind::Lint,
            params(json!({ "args": ["--minimum-failure-severity", "warning"] })),
        )
        .unwrap();
        assert_eq!(
            check.command(),
            ["tflint", "--recursive", "--minimum-failure-severity", "warning"]
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_params() {
        let err = CommandCheck::from_params(StageKind::Lint, params(json!({ "colour": "red" })))
            .err()
            .unwrap();
        assert!(err.to_string().contains("colour"));

        assert!(CommandCheck::from_params(StageKind::Lint, params(json!({ "command": [] }))).is_err());
        assert!(
            CommandCheck::from_params(StageKind::Format, params(json!({ "sarif_output": "x" })))
                .is_err()
        );
        assert!(
            CommandCheck::from_params(StageKind::Lint, params(json!({ "timeout_secs": "soon" })))
                .is_err()
        );
    }

    #[test]
    fn exit_status_maps_to_outcome() {
        let temp = tempdir().unwrap();
        let pass = CommandCheck::from_params(StageKind::Lint, params(json!({ "command": ["true"] })))
            .unwrap();
        assert_eq!(
            pass.run(&ctx(temp.path())).unwrap().outcome,
            crate::stage::StageOutcome::Passed
        );

        let fail = CommandCheck::from_params(
            StageKind::Lint,
            params(json!({ "command": ["sh", "-c", "echo 'rule violated' >&2; exit 2"] })),
        )
        .unwrap();
        let report = fail.run(&ctx(temp.path())).unwrap();
        assert_eq!(report.outcome, crate::stage::StageOutcome::Failed);
        assert_eq!(report.detail.as_deref(), Some("exit code 2: rule violated"));
    }

    #[test]
    fn format_failure_counts_files() {
        let temp = tempdir().unwrap();
        let check = CommandCheck::from_params(
            StageKind::Format,
            params(json!({ "command": ["sh", "-c", "printf 'main.tf\\nvariables.tf\\n'; exit 3"] })),
        )
        .unwrap();
        let report = check.run(&ctx(temp.path())).unwrap();
        assert_eq!(report.detail.as_deref(), Some("2 file(s) need formatting"));
    }

    #[test]
    fn missing_tool_is_an_error() {
        let temp = tempdir().unwrap();
        let check = CommandCheck::from_params(
            StageKind::SecurityScan,
            params(json!({ "command": ["/nonexistent/tfsec"] })),
        )
        .unwrap();
        assert!(check.run(&ctx(temp.path())).is_err());
    }

    #[test]
    fn sarif_stdout_is_saved_and_counted() {
        let temp = tempdir().unwrap();
        let sarif = temp.path().join("out/tflint.sarif");
        let script = r#"echo '{"runs":[{"results":[{"ruleId":"a"},{"ruleId":"b"}]}]}'; exit 2"#;
        let check = CommandCheck::from_params(
            StageKind::Lint,
            params(json!({
                "command": ["sh", "-c", script, "tflint"],
                "sarif_output": sarif.to_string_lossy(),
            })),
        )
        .unwrap();
        let report = check.run(&ctx(temp.path())).unwrap();
        assert_eq!(report.outcome, crate::stage::StageOutcome::Failed);
        assert_eq!(report.detail.as_deref(), Some("2 findings"));
        assert!(sarif.is_file());
    }

    #[test]
    fn version_pin_mismatch_is_not_run() {
        let temp = tempdir().unwrap();
        let check = CommandCheck::from_params(
            StageKind::Format,
            params(json!({
                "command": ["true"],
                "version_command": ["echo", "Terraform v1.5.7"],
            })),
        )
        .unwrap();
        let mut context = ctx(temp.path());

        context.terraform_version = Some("1.6.6".into());
        let report = check.run(&context).unwrap();
        assert_eq!(report.outcome, crate::stage::StageOutcome::NotRun);
        assert!(report.detail.unwrap().contains("1.6.6 required"));

        context.terraform_version = Some("v1.5.7".into());
        let report = check.run(&context).unwrap();
        assert_eq!(report.outcome, crate::stage::StageOutcome::Passed);
    }
}
