// ⚠️ Pipeline errors - every fatal failure names the stage it came from

use crate::median::EmptyTracker;
use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input: cannot read {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("output: cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A state reached the emitter without any absorbed amount. The store
    /// and the aggregator disagree, so the run must stop.
    #[error("invariant violated for {key}: {source}")]
    Invariant {
        key: String,
        #[source]
        source: EmptyTracker,
    },

    #[error("config: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn output(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PipelineError {
        let path = path.into();
        move |source| PipelineError::Output { path, source }
    }

    pub fn input(path: impl Into<PathBuf>) -> impl FnOnce(csv::Error) -> PipelineError {
        let path = path.into();
        move |source| PipelineError::Input { path, source }
    }

    /// Short stage name for the exit message.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Input { .. } => "input",
            PipelineError::Store(_) => "store",
            PipelineError::Output { .. } => "output",
            PipelineError::Invariant { .. } => "invariant",
            PipelineError::Config(_) => "config",
        }
    }
}
