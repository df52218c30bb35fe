//! # Sources
//!
//! Stages with no input. A source keeps calling its processor until it reports
//! [`Flow::NoMoreData`] or the stage is stopped.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{PipelineError, StageResult};
use super::processor::{Flow, FnProcessor, Outputs, Processor};
use super::stage::{OutputPolicy, Stage, StageLike};

/// Replaceable external feed of a channel-backed source.
pub(crate) type FeedSlot<OUT> = Arc<Mutex<Option<mpsc::Receiver<OUT>>>>;

/// A stage generating `OUT` items from an external feed.
pub struct Source<OUT> {
    stage: Stage<(), OUT>,
    feed: Option<FeedSlot<OUT>>,
}

impl<OUT> Clone for Source<OUT> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            feed: self.feed.clone(),
        }
    }
}

impl<OUT: Send + 'static> Source<OUT> {
    pub fn new(name: impl Into<String>, processor: impl Processor<(), OUT>) -> Self {
        Self {
            stage: Stage::new(name, processor).into_generator(),
            feed: None,
        }
    }

    /// A source driven by a closure called once per generated batch.
    pub fn from_fn<F>(name: impl Into<String>, mut generate: F) -> Self
    where
        F: FnMut(&mut Outputs<OUT>) -> anyhow::Result<Flow> + Send + 'static,
    {
        Self::new(
            name,
            FnProcessor::new(move |_: (), out: &mut Outputs<OUT>| generate(out)),
        )
    }

    /// A source emitting every value received on `feed`, routed by `route`. The
    /// source finishes when the feed closes.
    ///
    /// The feed is consumed by the run; give a new one with [`Source::set_feed`]
    /// before resuming again.
    pub fn from_channel<R>(name: impl Into<String>, feed: mpsc::Receiver<OUT>, mut route: R) -> Self
    where
        R: FnMut(&OUT) -> anyhow::Result<usize> + Send + 'static,
    {
        Self::from_channel_filtered(name, feed, move |value: &OUT| route(value).map(Some))
    }

    /// Like [`Source::from_channel`], but values routed to `None` are dropped.
    pub fn from_channel_filtered<R>(
        name: impl Into<String>,
        feed: mpsc::Receiver<OUT>,
        route: R,
    ) -> Self
    where
        R: FnMut(&OUT) -> anyhow::Result<Option<usize>> + Send + 'static,
    {
        let slot: FeedSlot<OUT> = Arc::new(Mutex::new(Some(feed)));
        let processor = ChannelFeed {
            slot: Arc::clone(&slot),
            current: None,
            route,
        };
        Self {
            stage: Stage::new(name, processor).into_generator(),
            feed: Some(slot),
        }
    }

    /// A source emitting a fixed list of values, from the start on every run.
    pub fn from_vec<R>(name: impl Into<String>, items: Vec<OUT>, route: R) -> Self
    where
        OUT: Clone,
        R: FnMut(&OUT) -> anyhow::Result<usize> + Send + 'static,
    {
        Self::new(
            name,
            VecFeed {
                items,
                cursor: 0,
                route,
            },
        )
    }

    pub fn with_multi_outputs(self, count: usize) -> Self {
        Self {
            stage: self.stage.with_multi_outputs(count),
            feed: self.feed,
        }
    }

    pub fn with_output_policy(self, policy: OutputPolicy) -> Self {
        Self {
            stage: self.stage.with_output_policy(policy),
            feed: self.feed,
        }
    }

    /// Install the feed the next run will read. Only valid for channel sources.
    pub fn set_feed(&self, feed: mpsc::Receiver<OUT>) -> StageResult {
        let slot = self.feed.as_ref().ok_or_else(|| {
            PipelineError::lifecycle(self.stage.name(), "source is not fed by a channel")
        })?;
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(feed);
        Ok(())
    }

    pub fn is_channel_fed(&self) -> bool {
        self.feed.is_some()
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn stage(&self) -> &Stage<(), OUT> {
        &self.stage
    }

    pub fn handle(&self) -> Arc<dyn StageLike> {
        self.stage.handle()
    }
}

struct ChannelFeed<OUT, R> {
    slot: FeedSlot<OUT>,
    current: Option<mpsc::Receiver<OUT>>,
    route: R,
}

#[async_trait]
impl<OUT, R> Processor<(), OUT> for ChannelFeed<OUT, R>
where
    OUT: Send + 'static,
    R: FnMut(&OUT) -> anyhow::Result<Option<usize>> + Send + 'static,
{
    async fn process(&mut self, _: (), out: &mut Outputs<OUT>) -> anyhow::Result<Flow> {
        let Some(feed) = self.current.as_mut() else {
            return Ok(Flow::NoMoreData);
        };
        match feed.recv().await {
            Some(value) => {
                if let Some(dest) = (self.route)(&value)? {
                    out.push(value, dest);
                }
                Ok(Flow::Continue)
            }
            None => Ok(Flow::NoMoreData),
        }
    }

    fn on_resume(&mut self) {
        self.current = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn on_finish(&mut self) {
        // Whoever still feeds us must notice we are gone.
        self.current = None;
    }
}

struct VecFeed<OUT, R> {
    items: Vec<OUT>,
    cursor: usize,
    route: R,
}

#[async_trait]
impl<OUT, R> Processor<(), OUT> for VecFeed<OUT, R>
where
    OUT: Clone + Send + 'static,
    R: FnMut(&OUT) -> anyhow::Result<usize> + Send + 'static,
{
    async fn process(&mut self, _: (), out: &mut Outputs<OUT>) -> anyhow::Result<Flow> {
        let Some(value) = self.items.get(self.cursor) else {
            return Ok(Flow::NoMoreData);
        };
        self.cursor += 1;
        let dest = (self.route)(value)?;
        out.push(value.clone(), dest);
        Ok(Flow::Continue)
    }

    fn on_resume(&mut self) {
        self.cursor = 0;
    }
}
