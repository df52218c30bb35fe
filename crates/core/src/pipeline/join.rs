//! # Joining Pipelines
//!
//! Splices two pipelines: every item the sink of the first one processes is also
//! fed to the channel-backed source of the second one.
//!
//! ```text
//! p1: ... → sink ─┐
//!                 └→ source → ... (p2)
//! ```
//!
//! The source's terminal status is watched by the sink like any downstream
//! status, so errors in the second pipeline reach the root of the first.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{PipelineError, StageResult};
use super::graph::Pipeline;
use super::processor::{Flow, Outputs, Processor};
use super::sink::Sink;
use super::source::Source;
use super::stage::{StageLike, CHANNEL_CAPACITY};

type ForwardSlot<T> = Arc<Mutex<Option<mpsc::Sender<T>>>>;

/// Build one pipeline out of `first` and `second`, where `sink` belongs to
/// `first` and `source` to `second`. The root of the result is the root of
/// `first`.
///
/// Auto-resume and stall settings of the two pipelines are not carried over.
pub fn join_two_pipelines<T>(
    first: Pipeline,
    sink: &Sink<T>,
    second: Pipeline,
    source: &Source<T>,
) -> StageResult<Pipeline>
where
    T: Clone + Send + 'static,
{
    if !source.is_channel_fed() {
        return Err(PipelineError::lifecycle(
            source.name(),
            "only a channel-fed source can be joined",
        ));
    }

    let slot: ForwardSlot<T> = Arc::new(Mutex::new(None));
    let forward_slot = Arc::clone(&slot);
    sink.stage().wrap_processor(move |inner| {
        let forwarding: Box<dyn Processor<T, ()>> = Box::new(Forwarding {
            inner,
            slot: forward_slot,
            current: None,
        });
        forwarding
    })?;

    let first_link = first.link_fn();
    let second_link = second.link_fn();
    let (sink, source) = (sink.clone(), source.clone());
    let link = move || {
        first_link()?;
        second_link()?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        source.set_feed(rx)?;
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        sink.stage().add_next_error(source.stage().error_link());
        tracing::trace!(sink = %sink.name(), source = %source.name(), "pipelines joined");
        Ok(())
    };

    let stages = first
        .stages()
        .iter()
        .chain(second.stages())
        .cloned()
        .collect();
    Ok(Pipeline::new(link, stages))
}

/// Sink processor that also hands each processed item to the joined source.
struct Forwarding<T> {
    inner: Box<dyn Processor<T, ()>>,
    slot: ForwardSlot<T>,
    current: Option<mpsc::Sender<T>>,
}

#[async_trait]
impl<T> Processor<T, ()> for Forwarding<T>
where
    T: Clone + Send + 'static,
{
    async fn process(&mut self, input: T, out: &mut Outputs<()>) -> anyhow::Result<Flow> {
        let copy = input.clone();
        let flow = self.inner.process(input, out).await?;

        if let Some(tx) = &self.current {
            if tx.send(copy).await.is_err() {
                // The joined source is gone; its status arrives through the next-error link.
                tracing::debug!("joined source closed its feed");
                self.current = None;
                return Ok(Flow::NoMoreData);
            }
        }
        Ok(flow)
    }

    async fn on_no_more_data(&mut self, out: &mut Outputs<()>) -> anyhow::Result<()> {
        let result = self.inner.on_no_more_data(out).await;
        self.current = None;
        result
    }

    fn on_error_sending(&mut self, failed: &[usize]) {
        self.inner.on_error_sending(failed);
    }

    fn on_resume(&mut self) {
        self.current = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.on_resume();
    }

    fn on_finish(&mut self) {
        self.current = None;
        self.inner.on_finish();
    }
}
