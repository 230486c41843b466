use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::builder::BoolishValueParser;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use tfgate::aggregator::{RunResult, ValidationAggregator};
use tfgate::checks;
use tfgate::config::{ConfigOverrides, RunConfiguration};
use tfgate::drift::drift_comment;
use tfgate::observability::{MetricsSnapshot, log_snapshot};
use tfgate::pipeline::{CheckRegistry, build_pipeline};
use tfgate::presets::generate_preset;
use tfgate::report::{append_markdown, read_json, render, render_markdown, write_json};
use tfgate::scheduler::ExecutionMode;
use tfgate::stage::{StageKind, StageOutcome};
use tfgate::validation::validate_config;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

const STEP_SUMMARY_ENV: &str = "GITHUB_STEP_SUMMARY";

fn main() -> Result<ExitCode> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Run {
            config,
            overrides,
            outputs,
            drift_comment,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            otlp_endpoint: _,
        } => run_pipeline(
            config,
            overrides,
            outputs,
            drift_comment,
            MetricsTargets {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
            },
        ),
        Commands::Report {
            config,
            overrides,
            outputs,
            outcomes,
        } => report_outcomes(config, overrides, outputs, &outcomes),
        Commands::Render { report, markdown } => render_saved(&report, markdown),
        Commands::Validate { config } => validate_config_cmd(config),
        Commands::ListStages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { preset, output } => {
            let generated = generate_preset(&preset, &output)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Configuration generated"
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tfgate", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "tfgate")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct MetricsTargets {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

fn run_pipeline(
    config_path: Option<PathBuf>,
    overrides: OverrideArgs,
    outputs: OutputArgs,
    drift_comment_path: Option<PathBuf>,
    metrics: MetricsTargets,
) -> Result<ExitCode> {
    let config = RunConfiguration::resolve(config_path.as_deref())?
        .with_overrides(overrides.into_overrides(Vec::new()))?;
    let registry = build_registry();

    let validation = validate_config(&config, &registry);
    for warning in &validation.warnings {
        warn!("{warning}");
    }
    if !validation.is_ok() {
        for error_msg in &validation.errors {
            error!("{error_msg}");
        }
        bail!(
            "Configuration is invalid ({} error(s)); run `tfgate validate` for details",
            validation.errors.len()
        );
    }

    let executor = build_pipeline(&registry, config)?;
    let metrics_handle = executor.metrics();
    let output = executor.execute()?;

    publish(&output.result, &outputs)?;

    if let Some(path) = drift_comment_path {
        match output.drift.first() {
            Some(found) => {
                let body = drift_comment(&found.output_file, &executor.config().working_directory);
                write_file(&path, &body)?;
                info!(stage = %found.stage, comment = %path.display(), "Drift comment written");
            }
            None => {
                if path.exists() {
                    fs::remove_file(&path).with_context(|| {
                        format!("Failed to remove stale drift comment: {}", path.display())
                    })?;
                }
            }
        }
    }

    export_metrics(&metrics_handle.snapshot(), &metrics)?;

    Ok(exit_code(&output.result))
}

fn report_outcomes(
    config_path: Option<PathBuf>,
    overrides: OverrideArgs,
    outputs: OutputArgs,
    outcomes: &[String],
) -> Result<ExitCode> {
    let parsed = outcomes
        .iter()
        .map(|raw| parse_outcome(raw))
        .collect::<Result<Vec<_>>>()?;

    // A step that GitHub skipped had its flag switched off.
    let mut skipped = Vec::new();
    for reported in parsed
        .iter()
        .filter(|reported| reported.outcome == StageOutcome::Skipped)
    {
        if let Some(detail) = reported.detail.as_deref().filter(|d| !d.is_empty()) {
            warn!(
                stage = %reported.stage,
                detail,
                "Detail ignored for skipped stage"
            );
        }
        skipped.push(reported.stage.clone());
    }

    let config = RunConfiguration::resolve(config_path.as_deref())?
        .with_overrides(overrides.into_overrides(skipped))?;
    let mut aggregator = ValidationAggregator::new(&config)?;

    for reported in parsed
        .into_iter()
        .filter(|reported| reported.outcome != StageOutcome::Skipped)
    {
        aggregator.record_outcome(&reported.stage, reported.outcome, reported.detail)?;
    }

    let pending = aggregator.pending();
    if !pending.is_empty() {
        warn!(stages = %pending.join(", "), "No outcome reported; counting as not run");
    }

    let result = aggregator.finalize();
    publish(&result, &outputs)?;
    Ok(exit_code(&result))
}

fn render_saved(path: &Path, markdown: bool) -> Result<ExitCode> {
    let result = read_json(path)?;
    if markdown {
        print!("{}", render_markdown(&result));
    } else {
        print!("{}", render(&result));
    }
    Ok(ExitCode::SUCCESS)
}

fn validate_config_cmd(config_path: Option<PathBuf>) -> Result<ExitCode> {
    let config = RunConfiguration::resolve(config_path.as_deref())?;
    let registry = build_registry();
    let report = validate_config(&config, &registry);
    let source = config_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());

    for warning in &report.warnings {
        warn!(file = %source, "{warning}");
    }

    if report.is_ok() {
        info!(file = %source, "Configuration validation passed");
        Ok(ExitCode::SUCCESS)
    } else {
        for error_msg in &report.errors {
            error!(file = %source, "{error_msg}");
        }
        Err(anyhow!(
            "Configuration validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn list_stages() {
    let registry = build_registry();
    let known = registry.known_checks();
    println!("Available stages:");
    for kind in StageKind::ALL {
        if !known.iter().any(|k| k == kind.as_str()) {
            continue;
        }
        let mandatory = if kind.is_mandatory() { " (mandatory)" } else { "" };
        println!("- {}{}: {}", kind, mandatory, kind.description());
    }
}

fn publish(result: &RunResult, outputs: &OutputArgs) -> Result<()> {
    print!("{}", render(result));

    if let Some(path) = &outputs.json_report {
        write_json(result, path)?;
        info!(report = %path.display(), "JSON report written");
    }
    if let Some(path) = &outputs.markdown_summary {
        append_markdown(result, path)?;
        info!(summary = %path.display(), "Markdown summary written");
    }
    if !outputs.no_step_summary
        && let Some(path) = env::var_os(STEP_SUMMARY_ENV).filter(|p| !p.is_empty())
    {
        let path = PathBuf::from(path);
        if outputs.markdown_summary.as_deref() != Some(path.as_path()) {
            append_markdown(result, &path)?;
        }
    }

    if result.is_soft_failed() {
        warn!(
            failed = result.failed_stages().len(),
            "Failures downgraded to warnings by soft-fail"
        );
    }
    Ok(())
}

fn export_metrics(snapshot: &MetricsSnapshot, targets: &MetricsTargets) -> Result<()> {
    if targets.print {
        log_snapshot(snapshot);
    }
    if let Some(path) = &targets.json {
        ensure_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &targets.prometheus {
        write_file(path, &snapshot.to_prometheus())?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content).with_context(|| format!("Failed to write file: {}", path.display()))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn exit_code(result: &RunResult) -> ExitCode {
    u8::try_from(result.exit_code)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}

struct ReportedOutcome {
    stage: String,
    outcome: StageOutcome,
    detail: Option<String>,
}

/// Parses `stage=status[:detail]`.
fn parse_outcome(raw: &str) -> Result<ReportedOutcome> {
    let Some((stage, rest)) = raw.split_once('=') else {
        bail!("Invalid outcome '{raw}'. Expected STAGE=STATUS[:DETAIL]");
    };
    let stage = stage.trim();
    if stage.is_empty() {
        bail!("Invalid outcome '{raw}'. Stage name is empty");
    }
    let (status, detail) = match rest.split_once(':') {
        Some((status, detail)) => (status, Some(detail.trim().to_string())),
        None => (rest, None),
    };
    let outcome = status
        .parse::<StageOutcome>()
        .with_context(|| format!("Invalid outcome for stage '{stage}'"))?;

    Ok(ReportedOutcome {
        stage: stage.to_string(),
        outcome,
        detail,
    })
}

fn build_registry() -> CheckRegistry {
    let mut registry = CheckRegistry::new();
    checks::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "tfgate",
    version,
    about = "Runs Terraform validation tools and aggregates their verdicts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled stage and aggregate the outcomes.
    Run {
        #[arg(long, env = "TFGATE_CONFIG")]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[command(flatten)]
        outputs: OutputArgs,
        #[arg(long = "drift-comment")]
        drift_comment: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Aggregate outcomes of tools that ran in separate workflow steps.
    Report {
        #[arg(long, env = "TFGATE_CONFIG")]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[command(flatten)]
        outputs: OutputArgs,
        #[arg(long = "outcome", value_name = "STAGE=STATUS[:DETAIL]")]
        outcomes: Vec<String>,
    },
    /// Re-render a saved JSON report.
    Render {
        report: PathBuf,
        #[arg(long)]
        markdown: bool,
    },
    Validate {
        config: Option<PathBuf>,
    },
    ListStages,
    /// Write a starter tfgate.yaml.
    Init {
        #[arg(long, default_value = "standard")]
        preset: String,
        #[arg(long, default_value = "tfgate.yaml")]
        output: PathBuf,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct OverrideArgs {
    #[arg(long, env = "TFGATE_WORKING_DIRECTORY")]
    working_directory: Option<PathBuf>,
    #[arg(long, env = "TFGATE_TERRAFORM_VERSION")]
    terraform_version: Option<String>,
    /// `--soft-fail` alone switches it on; `--soft-fail=false` overrides the file.
    #[arg(
        long,
        env = "TFGATE_SOFT_FAIL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    soft_fail: Option<bool>,
    #[arg(long, env = "TFGATE_SKIP", value_delimiter = ',')]
    skip: Vec<String>,
    #[arg(long, value_enum, env = "TFGATE_EXECUTION")]
    execution: Option<ExecutionMode>,
}

impl OverrideArgs {
    fn into_overrides(self, mut extra_skip: Vec<String>) -> ConfigOverrides {
        let mut skip = self.skip;
        skip.append(&mut extra_skip);
        skip.retain(|name| !name.trim().is_empty());
        skip.dedup();
        ConfigOverrides {
            working_directory: self.working_directory,
            terraform_version: self.terraform_version,
            soft_fail: self.soft_fail,
            execution: self.execution,
            skip,
        }
    }
}

#[derive(Args)]
struct OutputArgs {
    #[arg(long = "json-report")]
    json_report: Option<PathBuf>,
    #[arg(long = "markdown-summary")]
    markdown_summary: Option<PathBuf>,
    /// Do not append to $GITHUB_STEP_SUMMARY.
    #[arg(long)]
    no_step_summary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_outcome_with_detail() {
        let parsed = parse_outcome("lint=failure:3 issues: see log").unwrap();
        assert_eq!(parsed.stage, "lint");
        assert_eq!(parsed.outcome, StageOutcome::Failed);
        assert_eq!(parsed.detail.as_deref(), Some("3 issues: see log"));
    }

    #[test]
    fn rejects_malformed_outcomes() {
        assert!(parse_outcome("lint").is_err());
        assert!(parse_outcome("=passed").is_err());
        assert!(parse_outcome("lint=maybe").is_err());
    }

    fn soft_fail_arg(args: &[&str]) -> Option<bool> {
        let argv = ["tfgate", "report"].iter().chain(args).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Report { overrides, .. } => overrides.soft_fail,
            _ => unreachable!(),
        }
    }

    #[test]
    fn soft_fail_flag_can_switch_off() {
        assert_eq!(soft_fail_arg(&["--soft-fail"]), Some(true));
        assert_eq!(soft_fail_arg(&["--soft-fail=false"]), Some(false));
        assert_eq!(soft_fail_arg(&["--soft-fail", "--skip", "lint"]), Some(true));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
