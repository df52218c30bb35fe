//! # Pipelines
//!
//! A set of stages plus the function that links them. Resuming prepares every
//! stage, links them, and starts them consumers first, so no producer ever sends
//! before its consumer is running.
//!
//! Terminal statuses travel against the data: each stage reports to the stages
//! feeding it, and the first stage reports to the pipeline itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::{PipelineError, StageResult};
use super::stage::{StageLike, CHANNEL_CAPACITY};
use super::stall::{StallGate, StallRole};

/// Links the stages of a pipeline. Called on every resume, after all stages
/// are prepared.
pub type LinkFn = Arc<dyn Fn() -> StageResult + Send + Sync>;

/// An assembled graph of stages with shared start, stop and error semantics.
pub struct Pipeline {
    link: LinkFn,
    stages: Vec<Arc<dyn StageLike>>,
    auto_resume: Option<AutoResume>,
    top: Option<mpsc::Receiver<PipelineError>>,
    interceptor: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Stage 0 is the root: its status is what [`Pipeline::wait`] reports.
    pub fn new<F>(link: F, stages: Vec<Arc<dyn StageLike>>) -> Self
    where
        F: Fn() -> StageResult + Send + Sync + 'static,
    {
        Self {
            link: Arc::new(link),
            stages,
            auto_resume: None,
            top: None,
            interceptor: None,
        }
    }

    pub fn stages(&self) -> &[Arc<dyn StageLike>] {
        &self.stages
    }

    pub(crate) fn link_fn(&self) -> LinkFn {
        Arc::clone(&self.link)
    }

    /// Restart `target` (and the `affected` stages) with fresh channels every time
    /// it finishes, as long as `should_resume` says so.
    ///
    /// `relink` is called after the restarted stages are prepared again and must
    /// link them. The links of `target` to the stages feeding it are kept across
    /// restarts unless `relink` replaces them.
    pub fn with_auto_resume_at_stage<S, R>(
        mut self,
        target: usize,
        should_resume: S,
        relink: R,
        mut affected: Vec<usize>,
    ) -> Self
    where
        S: Fn() -> bool + Send + Sync + 'static,
        R: Fn() -> StageResult + Send + Sync + 'static,
    {
        affected.sort_unstable();
        affected.dedup();
        affected.retain(|&i| i != target);
        self.auto_resume = Some(AutoResume {
            target,
            should_resume: Arc::new(should_resume),
            relink: Arc::new(relink),
            affected,
            halted: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    /// Let the stages in `evaluate_at` decide, before reading each input, whether
    /// to stall the stages in `stall`. Once none of those is inside its processing
    /// function, `when_stalled` runs, and then they continue.
    pub fn with_stall_stages<W, S>(
        self,
        stall: &[usize],
        when_stalled: W,
        should_stall: S,
        evaluate_at: &[usize],
    ) -> Self
    where
        W: Fn() + Send + Sync + 'static,
        S: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let gate = StallGate::new(Arc::new(when_stalled), Arc::new(should_stall));
        for (i, stage) in self.stages.iter().enumerate() {
            let holds = stall.contains(&i);
            let evaluates = evaluate_at.contains(&i);
            if holds || evaluates {
                stage.attach_stall(StallRole::new(Arc::clone(&gate), holds, evaluates));
            }
        }
        self
    }

    /// Prepare, link and start every stage, last one first.
    pub fn resume(&mut self) -> StageResult {
        let root = self
            .stages
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::lifecycle("pipeline", "no stages"))?;

        for stage in &self.stages {
            stage.prepare();
        }
        (self.link)()?;
        self.top = Some(root.error_link());

        if let Some(auto) = &self.auto_resume {
            auto.halted.store(false, Ordering::SeqCst);
            self.interceptor = Some(auto.intercept(&self.stages)?);
        }

        for stage in self.stages.iter().rev() {
            stage.resume()?;
        }
        tracing::debug!(stages = self.stages.len(), "pipeline resumed");
        Ok(())
    }

    /// Block until the root stage reports, returning the combined error of every
    /// failed stage.
    pub async fn wait(&mut self) -> StageResult {
        let Some(mut top) = self.top.take() else {
            return Ok(());
        };
        let mut errors = Vec::new();
        while let Some(err) = top.recv().await {
            errors.push(Some(err));
        }
        if let Some(interceptor) = self.interceptor.take() {
            let _ = interceptor.await;
        }
        match PipelineError::coalesce(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop every stage, abandoning buffered data, and wait for all of them.
    pub async fn stop_and_wait(&mut self) -> StageResult {
        if let Some(auto) = &self.auto_resume {
            auto.halted.store(true, Ordering::SeqCst);
        }
        for stage in &self.stages {
            stage.request_stop();
        }

        let mut errors = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            errors.push(stage.stop_and_wait().await.err());
        }
        if let Some(interceptor) = self.interceptor.take() {
            interceptor.abort();
        }
        self.top = None;

        match PipelineError::coalesce(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct AutoResume {
    target: usize,
    should_resume: Arc<dyn Fn() -> bool + Send + Sync>,
    relink: LinkFn,
    affected: Vec<usize>,
    halted: Arc<AtomicBool>,
}

impl AutoResume {
    /// Put an interceptor between `target` and its upward links.
    fn intercept(&self, stages: &[Arc<dyn StageLike>]) -> StageResult<JoinHandle<()>> {
        let pick = |i: usize| {
            stages.get(i).cloned().ok_or_else(|| {
                PipelineError::lifecycle("pipeline", format!("auto-resume stage {i} out of range"))
            })
        };
        let target = pick(self.target)?;
        let affected = self
            .affected
            .iter()
            .map(|&i| pick(i))
            .collect::<StageResult<Vec<_>>>()?;

        let upward = target.take_error_links();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        target.set_error_links(vec![tx]);

        let restart = Restart {
            target,
            affected,
            should_resume: Arc::clone(&self.should_resume),
            relink: Arc::clone(&self.relink),
            halted: Arc::clone(&self.halted),
        };
        Ok(tokio::spawn(restart.run(upward, rx)))
    }
}

struct Restart {
    target: Arc<dyn StageLike>,
    affected: Vec<Arc<dyn StageLike>>,
    should_resume: Arc<dyn Fn() -> bool + Send + Sync>,
    relink: LinkFn,
    halted: Arc<AtomicBool>,
}

impl Restart {
    async fn run(
        self,
        mut upward: Vec<mpsc::Sender<PipelineError>>,
        mut status: mpsc::Receiver<PipelineError>,
    ) {
        let name = self.target.name().to_string();
        loop {
            while let Some(err) = status.recv().await {
                forward(&upward, err).await;
            }

            if self.halted.load(Ordering::SeqCst) || !(self.should_resume)() {
                tracing::debug!(stage = %name, "not resuming, closing upward links");
                return;
            }

            for stage in self.affected.iter().rev() {
                stage.prepare();
            }
            self.target.prepare();
            if let Err(err) = (self.relink)() {
                forward(&upward, err).await;
                return;
            }

            let relinked = self.target.take_error_links();
            if !relinked.is_empty() {
                upward = relinked;
            }
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            self.target.set_error_links(vec![tx]);
            status = rx;

            let resumed = self
                .affected
                .iter()
                .rev()
                .chain(std::iter::once(&self.target))
                .try_for_each(|stage| stage.resume());
            if let Err(err) = resumed {
                forward(&upward, err).await;
                return;
            }
            tracing::info!(stage = %name, "stage resumed automatically");
        }
    }
}

async fn forward(upward: &[mpsc::Sender<PipelineError>], err: PipelineError) {
    for tx in upward {
        let _ = tx.send(err.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{link_stages_at, Flow, Outputs, OutputPolicy, Sink, Source, Stage};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector() -> (Sink<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = Sink::from_fn("sink", move |x: u32| {
            sink_seen.lock().unwrap().push(x);
            Ok(())
        });
        (sink, seen)
    }

    fn three_stage(values: Vec<u32>, fail_on: Option<u32>) -> (Pipeline, Arc<Mutex<Vec<u32>>>) {
        let source = Source::from_vec("source", values, |_| Ok(0));
        let double = Stage::from_fn("double", move |x: u32, out: &mut Outputs<u32>| {
            if Some(x) == fail_on {
                anyhow::bail!("cannot double {x}");
            }
            out.push(x * 2, 0);
            Ok(Flow::Continue)
        });
        let (sink, seen) = collector();

        let stages = vec![source.handle(), double.handle(), sink.handle()];
        let pipeline = Pipeline::new(
            move || {
                link_stages_at(source.stage(), 0, &double, 0)?;
                link_stages_at(&double, 0, sink.stage(), 0)
            },
            stages,
        );
        (pipeline, seen)
    }

    #[tokio::test]
    async fn test_pipeline_delivers_everything_in_order() {
        let (mut pipeline, seen) = three_stage((1..=50).collect(), None);
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();

        let expected: Vec<u32> = (1..=50).map(|x| x * 2).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        for stage in pipeline.stages() {
            assert_eq!(stage.state(), crate::pipeline::StageState::Done);
        }
    }

    #[tokio::test]
    async fn test_pipeline_reports_stage_error() {
        let (mut pipeline, _seen) = three_stage((1..=50).collect(), Some(7));
        pipeline.resume().unwrap();
        let err = pipeline.wait().await.unwrap_err();
        assert_eq!(err.failed_stages(), vec!["double"]);
        assert!(err.to_string().contains("cannot double 7"));
    }

    #[tokio::test]
    async fn test_pipeline_empty_source() {
        let (mut pipeline, seen) = three_stage(Vec::new(), None);
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_can_be_resumed_again() {
        let (mut pipeline, seen) = three_stage(vec![1, 2, 3], None);
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6, 2, 4, 6]);
    }

    #[tokio::test]
    async fn test_sink_error_reaches_root() {
        let source = Source::from_vec("source", (0..100u32).collect(), |_| Ok(0));
        let sink = Sink::from_fn("picky_sink", |x: u32| {
            if x == 10 {
                anyhow::bail!("rejected {x}");
            }
            Ok(())
        });
        let stages = vec![source.handle(), sink.handle()];
        let (src, snk) = (source.clone(), sink.clone());
        let mut pipeline = Pipeline::new(
            move || link_stages_at(src.stage(), 0, snk.stage(), 0),
            stages,
        );

        pipeline.resume().unwrap();
        let err = pipeline.wait().await.unwrap_err();
        assert_eq!(err.failed_stages(), vec!["picky_sink"]);
    }

    #[tokio::test]
    async fn test_fan_out_and_fan_in_with_every_output_policy() {
        for policy in [
            OutputPolicy::Sequential,
            OutputPolicy::SequentialCyclesAllowed,
            OutputPolicy::Concurrent,
        ] {
            let source = Source::from_vec("source", (0..40u32).collect(), |x| Ok((*x % 2) as usize))
                .with_multi_outputs(2)
                .with_output_policy(policy);
            let left = Stage::from_fn("left", |x: u32, out: &mut Outputs<u32>| {
                out.push(x, 0);
                Ok(Flow::Continue)
            })
            .with_output_policy(policy);
            let right = Stage::from_fn("right", |x: u32, out: &mut Outputs<u32>| {
                out.push(x, 0);
                Ok(Flow::Continue)
            })
            .with_output_policy(policy);
            let (sink, seen) = collector();
            let sink = sink.with_multi_inputs(2);

            let stages = vec![source.handle(), left.handle(), right.handle(), sink.handle()];
            let mut pipeline = Pipeline::new(
                move || {
                    link_stages_at(source.stage(), 0, &left, 0)?;
                    link_stages_at(source.stage(), 1, &right, 0)?;
                    link_stages_at(&left, 0, sink.stage(), 0)?;
                    link_stages_at(&right, 0, sink.stage(), 1)
                },
                stages,
            );
            pipeline.resume().unwrap();
            pipeline.wait().await.unwrap();

            let mut got = seen.lock().unwrap().clone();
            got.sort_unstable();
            assert_eq!(got, (0..40).collect::<Vec<_>>(), "policy {policy:?}");
        }
    }

    #[tokio::test]
    async fn test_sequential_inputs_alternate() {
        let first = Source::from_vec("first", vec![1u32, 3, 5], |_| Ok(0));
        let second = Source::from_vec("second", vec![2u32, 4, 6], |_| Ok(0));
        let (sink, seen) = collector();
        let sink = sink.with_multi_inputs(2).with_sequential_inputs();

        let stages = vec![first.handle(), second.handle(), sink.handle()];
        let mut pipeline = Pipeline::new(
            move || {
                link_stages_at(first.stage(), 0, sink.stage(), 0)?;
                link_stages_at(second.stage(), 0, sink.stage(), 1)
            },
            stages,
        );
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_no_more_data_flushes_once_before_closing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let flushes = Arc::new(AtomicUsize::new(0));

        let source = Source::from_vec("source", Vec::<u32>::new(), |_| Ok(0));
        let (stage_log, stage_flushes) = (Arc::clone(&log), Arc::clone(&flushes));
        let stage = Stage::new(
            "batcher",
            crate::pipeline::FnProcessor::new(|x: u32, out: &mut Outputs<u32>| {
                out.push(x, 0);
                Ok(Flow::Continue)
            })
            .with_on_no_more_data(move |_out| {
                stage_flushes.fetch_add(1, Ordering::SeqCst);
                stage_log.lock().unwrap().push("flush");
                Ok(())
            }),
        );
        let sink_log = Arc::clone(&log);
        let sink = Sink::new(
            "sink",
            crate::pipeline::FnProcessor::new(|_: u32, _: &mut Outputs<()>| Ok(Flow::Continue))
                .with_on_no_more_data(move |_out| {
                    sink_log.lock().unwrap().push("sink saw closed input");
                    Ok(())
                }),
        );

        let stages = vec![source.handle(), stage.handle(), sink.handle()];
        let mut pipeline = Pipeline::new(
            move || {
                link_stages_at(source.stage(), 0, &stage, 0)?;
                link_stages_at(&stage, 0, sink.stage(), 0)
            },
            stages,
        );
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();

        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["flush", "sink saw closed input"]);
    }

    #[tokio::test]
    async fn test_stop_abandons_pending_feed() {
        let (tx, rx) = mpsc::channel(1);
        let source = Source::from_channel("source", rx, |_| Ok(0));
        let (sink, _seen) = collector();
        let stages = vec![source.handle(), sink.handle()];
        let (src, snk) = (source.clone(), sink.clone());
        let mut pipeline = Pipeline::new(
            move || link_stages_at(src.stage(), 0, snk.stage(), 0),
            stages,
        );

        pipeline.resume().unwrap();
        tx.send(1u32).await.unwrap();
        pipeline.stop_and_wait().await.unwrap();

        // The source dropped its feed, so senders notice.
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_auto_resume_restarts_source_and_sink() {
        let source = Source::from_vec("source", vec![1u32, 2, 3], |_| Ok(0));
        let (sink, seen) = collector();
        let restarts = Arc::new(AtomicUsize::new(0));

        let (src, snk) = (source.clone(), sink.clone());
        let link = move || link_stages_at(src.stage(), 0, snk.stage(), 0);
        let relink = link.clone();
        let counter = Arc::clone(&restarts);

        let mut pipeline = Pipeline::new(link, vec![source.handle(), sink.handle()])
            .with_auto_resume_at_stage(
                0,
                move || counter.fetch_add(1, Ordering::SeqCst) < 2,
                relink,
                vec![1],
            );
        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();

        assert_eq!(restarts.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stall_runs_callback_while_workers_idle() {
        let source = Source::from_vec("source", (0..30u32).collect(), |_| Ok(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let worker_flight = Arc::clone(&in_flight);
        let worker = Stage::new("worker", SlowForward { in_flight: worker_flight });
        let (sink, seen) = collector();

        let stages = vec![source.handle(), worker.handle(), sink.handle()];
        let evaluations = Arc::new(AtomicUsize::new(0));
        let stalled_with = Arc::new(Mutex::new(Vec::new()));

        let (eval, stalled, flight) = (
            Arc::clone(&evaluations),
            Arc::clone(&stalled_with),
            Arc::clone(&in_flight),
        );
        let mut pipeline = Pipeline::new(
            move || {
                link_stages_at(source.stage(), 0, &worker, 0)?;
                link_stages_at(&worker, 0, sink.stage(), 0)
            },
            stages,
        )
        .with_stall_stages(
            &[1],
            move || stalled.lock().unwrap().push(flight.load(Ordering::SeqCst)),
            move |_stage| eval.fetch_add(1, Ordering::SeqCst) == 10,
            &[0],
        );

        pipeline.resume().unwrap();
        pipeline.wait().await.unwrap();

        assert_eq!(*stalled_with.lock().unwrap(), vec![0]);
        assert_eq!(seen.lock().unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_failed_destination_reaches_on_error_sending() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let source = Source::from_vec("source", (0..100u32).collect(), |_| Ok(0));
        let stage_reports = Arc::clone(&reports);
        let fan = Stage::new(
            "fan",
            crate::pipeline::FnProcessor::new(|x: u32, out: &mut Outputs<u32>| {
                for copy in 0..4 {
                    out.push(x * 4 + copy, 0);
                }
                Ok(Flow::Continue)
            })
            .with_on_error_sending(move |failed| {
                stage_reports.lock().unwrap().push(failed.to_vec());
            }),
        );
        let sink = Sink::from_fn("rejecting_sink", |x: u32| -> anyhow::Result<()> {
            anyhow::bail!("rejected {x}")
        });

        let stages = vec![source.handle(), fan.handle(), sink.handle()];
        let mut pipeline = Pipeline::new(
            move || {
                link_stages_at(source.stage(), 0, &fan, 0)?;
                link_stages_at(&fan, 0, sink.stage(), 0)
            },
            stages,
        );
        pipeline.resume().unwrap();
        let err = pipeline.wait().await.unwrap_err();
        assert_eq!(err.failed_stages(), vec!["rejecting_sink"]);

        // The sink fails on its first value while "fan" still holds three more.
        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|failed| *failed == [0]));
    }

    #[tokio::test]
    async fn test_outputs_close_before_status_is_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "flusher",
            crate::pipeline::FnProcessor::new(|x: u32, out: &mut Outputs<u32>| {
                out.push(x, 0);
                Ok(Flow::Continue)
            })
            .with_on_no_more_data(|_out| Err(anyhow::anyhow!("flush failed"))),
        );
        let sink_log = Arc::clone(&log);
        let sink = Sink::new(
            "sink",
            crate::pipeline::FnProcessor::new(|_: u32, _: &mut Outputs<()>| Ok(Flow::Continue))
                .with_on_no_more_data(move |_out| {
                    sink_log.lock().unwrap().push("outputs closed");
                    Ok(())
                }),
        );

        stage.prepare();
        sink.stage().prepare();
        link_stages_at(&stage, 0, sink.stage(), 0).unwrap();
        let mut status = stage.error_link();

        let observer_log = Arc::clone(&log);
        let observer = tokio::spawn(async move {
            let reported = status.recv().await;
            observer_log.lock().unwrap().push("status reported");
            let closed = status.recv().await.is_none();
            (reported, closed)
        });

        // No input is linked, so the stage starts at end of data.
        sink.stage().resume().unwrap();
        stage.resume().unwrap();

        let (reported, closed) = tokio::time::timeout(Duration::from_secs(5), observer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reported.unwrap().failed_stages(), vec!["flusher"]);
        assert!(closed);
        assert_eq!(*log.lock().unwrap(), vec!["outputs closed", "status reported"]);
        assert!(stage.stop_and_wait().await.is_err());
        assert!(sink.stage().stop_and_wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_cycle_delivers_everything_and_stops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let items: Vec<(u32, u8)> = (0..100u32).map(|v| (v, 0)).collect();
        let source = Source::from_vec("source", items, |_| Ok(0));
        // Input 1 of the head is fed back from the tail.
        let head = Stage::from_fn("loop_head", |item: (u32, u8), out: &mut Outputs<(u32, u8)>| {
            out.push(item, 0);
            Ok(Flow::Continue)
        })
        .with_multi_inputs(2)
        .with_sequential_inputs()
        .with_output_policy(OutputPolicy::SequentialCyclesAllowed);
        let tail = Stage::from_fn(
            "loop_tail",
            |(v, hops): (u32, u8), out: &mut Outputs<(u32, u8)>| {
                if hops == 0 {
                    out.push((v, 1), 0);
                } else {
                    out.push((v, hops), 1);
                }
                Ok(Flow::Continue)
            },
        )
        .with_multi_outputs(2)
        .with_output_policy(OutputPolicy::SequentialCyclesAllowed);
        let sink = Sink::from_fn("sink", move |item: (u32, u8)| {
            tx.send(item)?;
            Ok(())
        });

        let stages = vec![source.handle(), head.handle(), tail.handle(), sink.handle()];
        let mut pipeline = Pipeline::new(
            move || {
                link_stages_at(source.stage(), 0, &head, 0)?;
                link_stages_at(&tail, 0, &head, 1)?;
                link_stages_at(&head, 0, &tail, 0)?;
                link_stages_at(&tail, 1, sink.stage(), 0)
            },
            stages,
        );
        pipeline.resume().unwrap();

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while got.len() < 100 {
                got.push(rx.recv().await.unwrap());
            }
        })
        .await
        .unwrap();
        assert!(got.iter().all(|&(_, hops)| hops == 1));
        let mut values: Vec<u32> = got.iter().map(|&(v, _)| v).collect();
        values.sort_unstable();
        assert_eq!(values, (0..100).collect::<Vec<_>>());

        tokio::time::timeout(Duration::from_secs(5), pipeline.stop_and_wait())
            .await
            .unwrap()
            .unwrap();
        for stage in pipeline.stages() {
            assert_eq!(stage.state(), crate::pipeline::StageState::Done);
        }
    }

    struct SlowForward {
        in_flight: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::pipeline::Processor<u32, u32> for SlowForward {
        async fn process(&mut self, x: u32, out: &mut Outputs<u32>) -> anyhow::Result<Flow> {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out.push(x, 0);
            Ok(Flow::Continue)
        }
    }
}
