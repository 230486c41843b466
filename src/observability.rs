use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::stage::StageOutcome;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub not_run: u64,
    pub overall_failed: bool,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub duration_ms: f64,
    pub outcome: Option<StageOutcome>,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_outcome(&self, stage_name: &str, outcome: StageOutcome) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.stages.entry(stage_name.to_string()).or_default().outcome = Some(outcome);
            match outcome {
                StageOutcome::Passed => guard.passed += 1,
                StageOutcome::Failed => guard.failed += 1,
                StageOutcome::Skipped => guard.skipped += 1,
                StageOutcome::NotRun => guard.not_run += 1,
            }
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_verdict(&self, overall_failed: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.overall_failed = overall_failed;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            guard.stages.entry(self.stage.clone()).or_default().duration_ms = duration_ms;
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        passed = snapshot.passed,
        failed = snapshot.failed,
        skipped = snapshot.skipped,
        not_run = snapshot.not_run,
        overall_failed = snapshot.overall_failed,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            duration_ms = metrics.duration_ms,
            outcome = metrics.outcome.map(|o| o.label()).unwrap_or("pending"),
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP tfgate_stages_total Stages by final outcome\n");
        output.push_str("# TYPE tfgate_stages_total gauge\n");
        for (label, value) in [
            ("passed", self.passed),
            ("failed", self.failed),
            ("skipped", self.skipped),
            ("not_run", self.not_run),
        ] {
            output.push_str(&format!(
                "tfgate_stages_total{{outcome=\"{}\"}} {}\n",
                label, value
            ));
        }
        output.push_str("# HELP tfgate_stage_duration_seconds Wall time of each stage\n");
        output.push_str("# TYPE tfgate_stage_duration_seconds gauge\n");
        for (stage, metrics) in &self.stages {
            if metrics.outcome == Some(StageOutcome::Skipped) {
                continue;
            }
            output.push_str(&format!(
                "tfgate_stage_duration_seconds{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP tfgate_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE tfgate_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "tfgate_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output.push_str("# HELP tfgate_pipeline_failed Whether any enabled stage failed or did not run\n");
        output.push_str("# TYPE tfgate_pipeline_failed gauge\n");
        output.push_str(&format!(
            "tfgate_pipeline_failed {}\n",
            u8::from(self.overall_failed)
        ));
        output
    }
}
