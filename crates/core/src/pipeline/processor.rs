//! # Processors
//!
//! The user-supplied half of a stage: what to do with each input, and how to flush
//! at end of input.

use async_trait::async_trait;

/// What the stage should do after a call to [`Processor::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading input.
    Continue,
    /// Clean end of data: flush, close outputs and finish without error.
    NoMoreData,
}

/// Output buffer handed to a processor on every call.
///
/// Each pushed value carries the index of the output slot it is routed to. The
/// buffer is owned by the stage task and drained after every call, so values can
/// never be observed by the processor once the next call begins.
pub struct Outputs<OUT> {
    items: Vec<(OUT, usize)>,
}

impl<OUT> Outputs<OUT> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Route `value` to output slot `dest`.
    pub fn push(&mut self, value: OUT, dest: usize) {
        self.items.push((value, dest));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn take_all(&mut self) -> std::vec::Drain<'_, (OUT, usize)> {
        self.items.drain(..)
    }
}

impl<OUT> Default for Outputs<OUT> {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing logic of a stage.
#[async_trait]
pub trait Processor<IN, OUT>: Send + 'static
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    /// Handle one input, pushing any number of routed outputs.
    async fn process(&mut self, input: IN, out: &mut Outputs<OUT>) -> anyhow::Result<Flow>;

    /// Called exactly once when every input has been closed and drained.
    async fn on_no_more_data(&mut self, _out: &mut Outputs<OUT>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when some outputs could not be delivered because their consumer is gone.
    fn on_error_sending(&mut self, _failed: &[usize]) {}

    /// Called at the start of every run, before the first input is read.
    fn on_resume(&mut self) {}

    /// Called once when the run ends, whether it finished, failed or was stopped.
    fn on_finish(&mut self) {}
}

type FlushFn<OUT> = Box<dyn FnMut(&mut Outputs<OUT>) -> anyhow::Result<()> + Send>;
type SendErrFn = Box<dyn FnMut(&[usize]) + Send>;

/// Adapter turning synchronous closures into a [`Processor`].
pub struct FnProcessor<F, OUT> {
    process: F,
    on_no_more_data: Option<FlushFn<OUT>>,
    on_error_sending: Option<SendErrFn>,
}

impl<F, OUT> FnProcessor<F, OUT> {
    pub fn new(process: F) -> Self {
        Self {
            process,
            on_no_more_data: None,
            on_error_sending: None,
        }
    }

    pub fn with_on_no_more_data(
        mut self,
        f: impl FnMut(&mut Outputs<OUT>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.on_no_more_data = Some(Box::new(f));
        self
    }

    pub fn with_on_error_sending(mut self, f: impl FnMut(&[usize]) + Send + 'static) -> Self {
        self.on_error_sending = Some(Box::new(f));
        self
    }
}

#[async_trait]
impl<IN, OUT, F> Processor<IN, OUT> for FnProcessor<F, OUT>
where
    IN: Send + 'static,
    OUT: Send + 'static,
    F: FnMut(IN, &mut Outputs<OUT>) -> anyhow::Result<Flow> + Send + 'static,
{
    async fn process(&mut self, input: IN, out: &mut Outputs<OUT>) -> anyhow::Result<Flow> {
        (self.process)(input, out)
    }

    async fn on_no_more_data(&mut self, out: &mut Outputs<OUT>) -> anyhow::Result<()> {
        match self.on_no_more_data.as_mut() {
            Some(flush) => flush(out),
            None => Ok(()),
        }
    }

    fn on_error_sending(&mut self, failed: &[usize]) {
        if let Some(f) = self.on_error_sending.as_mut() {
            f(failed);
        }
    }
}

/// Processor that discards its input. Used as a placeholder while a processor is
/// being wrapped.
pub(crate) struct Discard;

#[async_trait]
impl<IN, OUT> Processor<IN, OUT> for Discard
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    async fn process(&mut self, _input: IN, _out: &mut Outputs<OUT>) -> anyhow::Result<Flow> {
        Ok(Flow::Continue)
    }
}
