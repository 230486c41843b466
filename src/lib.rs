pub mod aggregator;
pub mod checks;
pub mod config;
pub mod drift;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod report;
pub mod sarif;
pub mod scheduler;
pub mod stage;
pub mod validation;

pub use aggregator::{AggregatorError, RunResult, ValidationAggregator};
pub use config::{ConfigOverrides, RunConfiguration, StageSpec};
pub use pipeline::{CheckRegistry, PipelineExecutor, PipelineOutput, build_pipeline};
pub use stage::{CheckStage, StageKind, StageOutcome};
