use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How enabled stages are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn is_parallel(&self) -> bool {
        matches!(self, ExecutionMode::Parallel)
    }
}
