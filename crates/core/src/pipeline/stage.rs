//! # Stages
//!
//! A stage owns its incoming channels, borrows its consumers' incoming channels as
//! outputs, and keeps one reverse error link per output.
//!
//! ## Lifecycle
//!
//! ```text
//! Unprepared → Prepared → Running → Done
//!                  ↑                  │
//!                  └──────────────────┘  (prepare again, e.g. on auto-resume)
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::{PipelineError, StageResult};
use super::processor::{Discard, Flow, FnProcessor, Outputs, Processor};
use super::run::{run_stage, Run, RunInput};
use super::stall::StallRole;

/// Capacity of every data and error channel. One slot is the closest tokio gets to
/// a rendezvous channel: a producer is at most one item ahead of its consumer.
pub const CHANNEL_CAPACITY: usize = 1;

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Unprepared,
    Prepared,
    Running,
    Done,
}

/// How a stage with several input channels reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Strict round robin in index order. A blocked channel stalls the rotation.
    Sequential,
    /// One reader task per channel, no order across channels.
    #[default]
    Concurrent,
}

/// How a stage delivers the outputs of one processing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Await each send in order. Cheapest, but the stage graph must be acyclic.
    Sequential,
    /// Keep trying every pending destination without blocking on any single one.
    #[default]
    SequentialCyclesAllowed,
    /// One task per send, unordered.
    Concurrent,
}

/// Type-erased view of a stage, used by pipelines.
#[async_trait]
pub trait StageLike: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> StageState;

    /// Allocate fresh channels. Ignored while the stage is running.
    fn prepare(&self);

    /// Launch the stage task. Every output must be linked.
    fn resume(&self) -> StageResult;

    /// Ask the running task to stop, without waiting for it.
    fn request_stop(&self);

    /// Stop the task, abandoning buffered data, and return its terminal status.
    async fn stop_and_wait(&self) -> StageResult;

    /// Create a new upward link on which this stage reports its terminal status.
    fn error_link(&self) -> mpsc::Receiver<PipelineError>;

    /// Remove and return every upward link of the current run.
    fn take_error_links(&self) -> Vec<mpsc::Sender<PipelineError>>;

    /// Replace the upward links of the current run.
    fn set_error_links(&self, links: Vec<mpsc::Sender<PipelineError>>);

    /// Watch an additional downstream status, as if it came from an output.
    fn add_next_error(&self, link: mpsc::Receiver<PipelineError>);

    fn attach_stall(&self, role: StallRole);
}

pub(crate) type SharedProcessor<IN, OUT> = Arc<tokio::sync::Mutex<Box<dyn Processor<IN, OUT>>>>;

pub(crate) struct Inner<IN, OUT> {
    pub(crate) name: String,
    pub(crate) processor: SharedProcessor<IN, OUT>,
    core: Mutex<Core<IN, OUT>>,
}

impl<IN, OUT> Inner<IN, OUT> {
    pub(crate) fn core(&self) -> MutexGuard<'_, Core<IN, OUT>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct Core<IN, OUT> {
    pub(crate) state: StageState,
    input_count: usize,
    output_count: usize,
    input_policy: InputPolicy,
    output_policy: OutputPolicy,
    generator: Option<fn() -> IN>,
    incoming_txs: Vec<Option<mpsc::Sender<IN>>>,
    incoming_rxs: Vec<mpsc::Receiver<IN>>,
    outgoing: Vec<Option<mpsc::Sender<OUT>>>,
    next_errs: Vec<mpsc::Receiver<PipelineError>>,
    err_txs: Vec<mpsc::Sender<PipelineError>>,
    stall: Option<StallRole>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<StageResult>>,
}

/// A pipeline node transforming `IN` items into routed `OUT` items.
///
/// `Stage` is a handle: clones refer to the same node.
pub struct Stage<IN, OUT> {
    inner: Arc<Inner<IN, OUT>>,
}

impl<IN, OUT> Clone for Stage<IN, OUT> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<IN, OUT> Stage<IN, OUT>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    /// A stage with one input and one output.
    pub fn new(name: impl Into<String>, processor: impl Processor<IN, OUT>) -> Self {
        let core = Core {
            state: StageState::Unprepared,
            input_count: 1,
            output_count: 1,
            input_policy: InputPolicy::default(),
            output_policy: OutputPolicy::default(),
            generator: None,
            incoming_txs: Vec::new(),
            incoming_rxs: Vec::new(),
            outgoing: Vec::new(),
            next_errs: Vec::new(),
            err_txs: Vec::new(),
            stall: None,
            stop_tx: None,
            task: None,
        };
        let processor: Box<dyn Processor<IN, OUT>> = Box::new(processor);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                processor: Arc::new(tokio::sync::Mutex::new(processor)),
                core: Mutex::new(core),
            }),
        }
    }

    /// A stage driven by a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(IN, &mut Outputs<OUT>) -> anyhow::Result<Flow> + Send + 'static,
    {
        Self::new(name, FnProcessor::new(f))
    }

    pub fn with_multi_inputs(self, count: usize) -> Self {
        self.inner.core().input_count = count;
        self
    }

    pub fn with_multi_outputs(self, count: usize) -> Self {
        self.inner.core().output_count = count;
        self
    }

    pub fn with_sequential_inputs(self) -> Self {
        self.inner.core().input_policy = InputPolicy::Sequential;
        self
    }

    pub fn with_concurrent_inputs(self) -> Self {
        self.inner.core().input_policy = InputPolicy::Concurrent;
        self
    }

    pub fn with_output_policy(self, policy: OutputPolicy) -> Self {
        self.inner.core().output_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> StageState {
        self.inner.core().state
    }

    pub fn input_count(&self) -> usize {
        self.inner.core().input_count
    }

    pub fn output_count(&self) -> usize {
        self.inner.core().output_count
    }

    /// Type-erased handle to this stage.
    pub fn handle(&self) -> Arc<dyn StageLike> {
        Arc::new(self.clone())
    }

    /// Swap the processor for one built around it. Fails while the stage runs.
    pub(crate) fn wrap_processor<F>(&self, wrap: F) -> StageResult
    where
        F: FnOnce(Box<dyn Processor<IN, OUT>>) -> Box<dyn Processor<IN, OUT>>,
    {
        let mut guard = self.inner.processor.try_lock().map_err(|_| {
            PipelineError::lifecycle(&self.inner.name, "processor is in use by a running task")
        })?;
        let current = std::mem::replace(&mut *guard, Box::new(Discard));
        *guard = wrap(current);
        Ok(())
    }

    fn take_incoming(&self, index: usize) -> Result<mpsc::Sender<IN>, String> {
        let mut core = self.inner.core();
        if core.state != StageState::Prepared {
            return Err(format!("{} is {:?}, not prepared", self.inner.name, core.state));
        }
        match core.incoming_txs.get_mut(index) {
            None => Err(format!("input index {index} out of range")),
            Some(slot) => slot.take().ok_or_else(|| format!("input {index} is already linked")),
        }
    }

    fn check_outgoing(&self, index: usize) -> Result<(), String> {
        let core = self.inner.core();
        if core.state != StageState::Prepared {
            return Err(format!("{} is {:?}, not prepared", self.inner.name, core.state));
        }
        match core.outgoing.get(index) {
            None => Err(format!("output index {index} out of range")),
            Some(Some(_)) => Err(format!("output {index} is already linked")),
            Some(None) => Ok(()),
        }
    }

    fn set_outgoing(
        &self,
        index: usize,
        tx: mpsc::Sender<OUT>,
        status: mpsc::Receiver<PipelineError>,
    ) {
        let mut core = self.inner.core();
        if let Some(slot) = core.outgoing.get_mut(index) {
            *slot = Some(tx);
        }
        core.next_errs.push(status);
    }

    fn push_error_link(&self) -> mpsc::Receiver<PipelineError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.inner.core().err_txs.push(tx);
        rx
    }
}

impl<OUT> Stage<(), OUT>
where
    OUT: Send + 'static,
{
    /// Turn this stage into a generator: no input channels, and the processor is
    /// called repeatedly until it reports [`Flow::NoMoreData`].
    pub(crate) fn into_generator(self) -> Self {
        {
            let mut core = self.inner.core();
            core.input_count = 0;
            core.generator = Some(|| ());
        }
        self
    }
}

#[async_trait]
impl<IN, OUT> StageLike for Stage<IN, OUT>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> StageState {
        self.inner.core().state
    }

    fn prepare(&self) {
        let mut core = self.inner.core();
        if core.state == StageState::Running {
            tracing::warn!(stage = %self.inner.name, "prepare called on a running stage, ignored");
            return;
        }

        let (txs, rxs): (Vec<_>, Vec<_>) = (0..core.input_count)
            .map(|_| {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                (Some(tx), rx)
            })
            .unzip();
        core.incoming_txs = txs;
        core.incoming_rxs = rxs;
        core.outgoing = (0..core.output_count).map(|_| None).collect();
        core.next_errs.clear();
        core.err_txs.clear();
        core.stop_tx = None;
        core.state = StageState::Prepared;
        tracing::trace!(stage = %self.inner.name, "stage prepared");
    }

    fn resume(&self) -> StageResult {
        let mut core = self.inner.core();
        if core.state != StageState::Prepared {
            return Err(PipelineError::lifecycle(
                &self.inner.name,
                format!("cannot resume from state {:?}", core.state),
            ));
        }
        if let Some(index) = core.outgoing.iter().position(Option::is_none) {
            return Err(PipelineError::lifecycle(
                &self.inner.name,
                format!("output {index} is not linked"),
            ));
        }

        // Inputs nobody linked count as closed.
        core.incoming_txs.clear();

        let input = match core.generator {
            Some(generator) => RunInput::Generator(generator),
            None => RunInput::Channels(std::mem::take(&mut core.incoming_rxs)),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let run = Run {
            input,
            input_policy: core.input_policy,
            output_policy: core.output_policy,
            outgoing: std::mem::take(&mut core.outgoing)
                .into_iter()
                .flatten()
                .collect(),
            next_errs: std::mem::take(&mut core.next_errs),
            err_txs: std::mem::take(&mut core.err_txs),
            stall: core.stall.clone(),
            stop_rx,
        };

        core.stop_tx = Some(stop_tx);
        core.state = StageState::Running;
        core.task = Some(tokio::spawn(run_stage(Arc::clone(&self.inner), run)));
        tracing::debug!(stage = %self.inner.name, "stage resumed");
        Ok(())
    }

    fn request_stop(&self) {
        if let Some(stop) = self.inner.core().stop_tx.take() {
            let _ = stop.send(());
        }
    }

    async fn stop_and_wait(&self) -> StageResult {
        let (stop, task) = {
            let mut core = self.inner.core();
            (core.stop_tx.take(), core.task.take())
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        match task {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::lifecycle(
                    &self.inner.name,
                    format!("stage task failed: {e}"),
                )),
            },
        }
    }

    fn error_link(&self) -> mpsc::Receiver<PipelineError> {
        self.push_error_link()
    }

    fn take_error_links(&self) -> Vec<mpsc::Sender<PipelineError>> {
        std::mem::take(&mut self.inner.core().err_txs)
    }

    fn set_error_links(&self, links: Vec<mpsc::Sender<PipelineError>>) {
        self.inner.core().err_txs = links;
    }

    fn add_next_error(&self, link: mpsc::Receiver<PipelineError>) {
        self.inner.core().next_errs.push(link);
    }

    fn attach_stall(&self, role: StallRole) {
        self.inner.core().stall = Some(role);
    }
}

/// Connect output `out_index` of `producer` to input `in_index` of `consumer`.
///
/// The consumer's incoming channel becomes the producer's output, and a reverse
/// link is created so the producer learns the consumer's terminal status. Both
/// stages must be prepared.
pub fn link_stages_at<A, T, B>(
    producer: &Stage<A, T>,
    out_index: usize,
    consumer: &Stage<T, B>,
    in_index: usize,
) -> StageResult
where
    A: Send + 'static,
    T: Send + 'static,
    B: Send + 'static,
{
    let link_error = |reason: String| PipelineError::Link {
        producer: producer.name().to_string(),
        out_index,
        consumer: consumer.name().to_string(),
        in_index,
        reason,
    };

    producer.check_outgoing(out_index).map_err(link_error)?;
    let tx = consumer.take_incoming(in_index).map_err(link_error)?;
    let status = consumer.push_error_link();
    producer.set_outgoing(out_index, tx, status);

    tracing::trace!(
        producer = %producer.name(),
        out_index,
        consumer = %consumer.name(),
        in_index,
        "stages linked"
    );
    Ok(())
}

/// Link output `i` of `producer` to input 0 of `consumers[i]`.
pub fn link_stages<A, T, B>(producer: &Stage<A, T>, consumers: &[&Stage<T, B>]) -> StageResult
where
    A: Send + 'static,
    T: Send + 'static,
    B: Send + 'static,
{
    if consumers.len() != producer.output_count() {
        return Err(PipelineError::lifecycle(
            producer.name(),
            format!(
                "{} outputs but {} consumers given",
                producer.output_count(),
                consumers.len()
            ),
        ));
    }
    for (i, consumer) in consumers.iter().enumerate() {
        link_stages_at(producer, i, consumer, 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubler(name: &str) -> Stage<u32, u32> {
        Stage::from_fn(name, |x: u32, out: &mut Outputs<u32>| {
            out.push(x * 2, 0);
            Ok(Flow::Continue)
        })
    }

    #[test]
    fn test_new_stage_is_unprepared() {
        let stage = doubler("a");
        assert_eq!(stage.state(), StageState::Unprepared);
        assert_eq!(stage.input_count(), 1);
        assert_eq!(stage.output_count(), 1);
    }

    #[tokio::test]
    async fn test_link_requires_prepared_stages() {
        let a = doubler("a");
        let b = doubler("b");
        let err = link_stages_at(&a, 0, &b, 0).unwrap_err();
        assert!(matches!(err, PipelineError::Link { .. }));
    }

    #[tokio::test]
    async fn test_link_twice_fails() {
        let a = doubler("a");
        let b = doubler("b").with_multi_inputs(2);
        a.prepare();
        b.prepare();
        link_stages_at(&a, 0, &b, 0).unwrap();

        let err = link_stages_at(&a, 0, &b, 1).unwrap_err();
        assert!(err.to_string().contains("already linked"));
    }

    #[tokio::test]
    async fn test_link_out_of_range() {
        let a = doubler("a");
        let b = doubler("b");
        a.prepare();
        b.prepare();
        let err = link_stages_at(&a, 3, &b, 0).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        // A failed link leaves the consumer input untouched.
        link_stages_at(&a, 0, &b, 0).unwrap();
    }

    #[tokio::test]
    async fn test_resume_requires_linked_outputs() {
        let a = doubler("a");
        a.prepare();
        let err = a.resume().unwrap_err();
        assert!(err.to_string().contains("output 0 is not linked"));
    }

    #[tokio::test]
    async fn test_resume_requires_prepare() {
        let a = doubler("a").with_multi_outputs(0);
        assert!(a.resume().is_err());
        a.prepare();
        a.resume().unwrap();
        assert!(a.resume().is_err());
        a.stop_and_wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_without_inputs_finishes() {
        let a = doubler("a").with_multi_inputs(0).with_multi_outputs(0);
        a.prepare();
        let status = a.error_link();
        a.resume().unwrap();
        a.stop_and_wait().await.unwrap();
        assert_eq!(a.state(), StageState::Done);
        drop(status);
    }
}
