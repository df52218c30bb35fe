//! # Sinks
//!
//! Terminal stages: they consume `IN` items and emit nothing. A sink has no
//! output slots, so its teardown has no downstream status to wait for.

use std::sync::Arc;

use super::processor::{Flow, FnProcessor, Outputs, Processor};
use super::stage::{Stage, StageLike};

/// A stage with no outputs.
pub struct Sink<IN> {
    stage: Stage<IN, ()>,
}

impl<IN> Clone for Sink<IN> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
        }
    }
}

impl<IN: Send + 'static> Sink<IN> {
    pub fn new(name: impl Into<String>, processor: impl Processor<IN, ()>) -> Self {
        Self {
            stage: Stage::new(name, processor).with_multi_outputs(0),
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, mut consume: F) -> Self
    where
        F: FnMut(IN) -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(
            name,
            FnProcessor::new(move |input: IN, _: &mut Outputs<()>| {
                consume(input)?;
                Ok(Flow::Continue)
            }),
        )
    }

    pub fn with_multi_inputs(self, count: usize) -> Self {
        Self {
            stage: self.stage.with_multi_inputs(count),
        }
    }

    pub fn with_sequential_inputs(self) -> Self {
        Self {
            stage: self.stage.with_sequential_inputs(),
        }
    }

    pub fn with_concurrent_inputs(self) -> Self {
        Self {
            stage: self.stage.with_concurrent_inputs(),
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn stage(&self) -> &Stage<IN, ()> {
        &self.stage
    }

    pub fn handle(&self) -> Arc<dyn StageLike> {
        self.stage.handle()
    }
}
