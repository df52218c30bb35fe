//! # Pipeline Errors
//!
//! Terminal status of a stage, as it travels upstream along the reverse error links.

use std::sync::Arc;
use thiserror::Error;

/// Shared, type-erased cause of a processing failure.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used by every lifecycle operation of the engine.
pub type StageResult<T = ()> = std::result::Result<T, PipelineError>;

/// Errors produced while linking, running or stopping stages.
///
/// Cloning is cheap: the underlying cause is shared, so a single failure can be
/// returned from `stop_and_wait` and propagated upstream at the same time.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A processing function or a no-more-data hook failed.
    #[error("stage {stage}: {source}")]
    Process {
        /// Name of the failing stage.
        stage: String,
        /// Cause reported by the processor.
        source: ErrorSource,
    },

    /// Two stages could not be linked.
    #[error("cannot link {producer}[{out_index}] -> {consumer}[{in_index}]: {reason}")]
    Link {
        producer: String,
        out_index: usize,
        consumer: String,
        in_index: usize,
        reason: String,
    },

    /// A lifecycle call was made in the wrong state, or the stage task died.
    #[error("stage {stage}: {reason}")]
    Lifecycle { stage: String, reason: String },

    /// Several stages failed.
    #[error("{}", render_multiple(.0))]
    Multiple(Vec<PipelineError>),
}

fn render_multiple(errors: &[PipelineError]) -> String {
    let mut out = format!("multiple ({}) errors:", errors.len());
    for err in errors {
        out.push('\n');
        out.push_str(&err.to_string());
    }
    out
}

impl PipelineError {
    /// Wrap a processor failure.
    pub fn process(stage: impl Into<String>, err: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = err.into();
        Self::Process {
            stage: stage.into(),
            source: Arc::from(boxed),
        }
    }

    pub fn lifecycle(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lifecycle {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Combine any number of optional errors into at most one.
    ///
    /// Nested `Multiple` values are flattened and errors that render identically are
    /// reported once, since the same failure can reach an upstream stage through
    /// several links of a mesh.
    pub fn coalesce<I>(errors: I) -> Option<PipelineError>
    where
        I: IntoIterator<Item = Option<PipelineError>>,
    {
        let mut flat = Vec::new();
        for err in errors.into_iter().flatten() {
            err.flatten_into(&mut flat);
        }

        let mut seen = std::collections::HashSet::new();
        flat.retain(|e| seen.insert(e.to_string()));

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(PipelineError::Multiple(flat)),
        }
    }

    fn flatten_into(self, out: &mut Vec<PipelineError>) {
        match self {
            PipelineError::Multiple(inner) => {
                for err in inner {
                    err.flatten_into(out);
                }
            }
            other => out.push(other),
        }
    }

    /// Names of the stages this error reports as failed.
    pub fn failed_stages(&self) -> Vec<&str> {
        match self {
            PipelineError::Process { stage, .. } | PipelineError::Lifecycle { stage, .. } => {
                vec![stage.as_str()]
            }
            PipelineError::Link { producer, .. } => vec![producer.as_str()],
            PipelineError::Multiple(inner) => {
                inner.iter().flat_map(|e| e.failed_stages()).collect()
            }
        }
    }
}
