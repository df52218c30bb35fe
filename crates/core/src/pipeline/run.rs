//! # Stage Task
//!
//! Body of the tokio task behind a running stage: read, process, deliver, and on
//! exit tear down in a fixed order.
//!
//! ## Teardown
//!
//! 1. Drop the inputs, so producers still sending observe the closure.
//! 2. Close every output.
//! 3. Wait for every downstream status link to close, collecting errors. A
//!    stopped stage only takes the errors already delivered.
//! 4. Mark the stage `Done`, report the combined error upstream, close the upward links.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use super::error::{PipelineError, StageResult};
use super::processor::{Flow, Outputs, Processor};
use super::stage::{Inner, InputPolicy, OutputPolicy, StageState, CHANNEL_CAPACITY};
use super::stall::StallRole;

pub(crate) enum RunInput<IN> {
    Generator(fn() -> IN),
    Channels(Vec<mpsc::Receiver<IN>>),
}

/// Everything a run takes out of the stage when it is resumed.
pub(crate) struct Run<IN, OUT> {
    pub(crate) input: RunInput<IN>,
    pub(crate) input_policy: InputPolicy,
    pub(crate) output_policy: OutputPolicy,
    pub(crate) outgoing: Vec<mpsc::Sender<OUT>>,
    pub(crate) next_errs: Vec<mpsc::Receiver<PipelineError>>,
    pub(crate) err_txs: Vec<mpsc::Sender<PipelineError>>,
    pub(crate) stall: Option<StallRole>,
    pub(crate) stop_rx: oneshot::Receiver<()>,
}

/// Why the processing loop ended.
enum Exit {
    Finished,
    Failed(PipelineError),
    /// A downstream stage reported an error, or every downstream link closed.
    /// `pending` lists the outputs that still had undelivered values.
    Downstream {
        err: Option<PipelineError>,
        pending: Vec<usize>,
    },
    SendFailed(Vec<usize>),
    Stopped,
}

pub(crate) async fn run_stage<IN, OUT>(inner: Arc<Inner<IN, OUT>>, run: Run<IN, OUT>) -> StageResult
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    let Run {
        input,
        input_policy,
        output_policy,
        outgoing,
        next_errs,
        err_txs,
        stall,
        mut stop_rx,
    } = run;
    let name = inner.name.as_str();

    let mut processor = Arc::clone(&inner.processor).lock_owned().await;
    processor.on_resume();

    let mut reader = Reader::start(input, input_policy);
    let mut emitter = Emitter::new(name, outgoing, output_policy);
    let mut next = NextErrors::new(next_errs);
    let mut outputs = Outputs::new();

    let exit = {
        let work = drive(
            name,
            &mut **processor,
            &mut reader,
            &mut emitter,
            &mut outputs,
            &mut next,
            stall.as_ref(),
        );
        tokio::select! {
            biased;
            _ = &mut stop_rx => Exit::Stopped,
            exit = work => exit,
        }
    };

    let mut own = None;
    let mut send_failed = false;
    let stopped = matches!(exit, Exit::Stopped);
    match exit {
        Exit::Finished => tracing::debug!(stage = %name, "no more data"),
        Exit::Stopped => tracing::debug!(stage = %name, "stopped"),
        Exit::Failed(err) => {
            tracing::warn!(stage = %name, error = %err, "processing failed");
            own = Some(err);
        }
        Exit::Downstream { err, pending } => {
            tracing::debug!(stage = %name, failed = err.is_some(), ?pending, "downstream finished");
            if !pending.is_empty() {
                processor.on_error_sending(&pending);
            }
            own = err;
        }
        Exit::SendFailed(failed) => {
            tracing::debug!(stage = %name, ?failed, "outputs closed while sending");
            processor.on_error_sending(&failed);
            send_failed = true;
        }
    }

    drop(reader);
    drop(emitter);
    // A stopped stage may sit in a cycle, so it only takes what has already arrived.
    let downstream = if stopped {
        next.drain_ready()
    } else {
        next.drain().await
    };
    let mut status = PipelineError::coalesce([own, downstream]);
    if send_failed && status.is_none() {
        status = Some(PipelineError::lifecycle(
            name,
            "an output closed before accepting all data",
        ));
    }

    processor.on_finish();
    drop(processor);

    inner.core().state = StageState::Done;
    deliver(name, status.as_ref(), err_txs);
    tracing::trace!(stage = %name, "stage done");

    match status {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Send `status` on every upward link still open, then close them all.
fn deliver(name: &str, status: Option<&PipelineError>, err_txs: Vec<mpsc::Sender<PipelineError>>) {
    if let Some(err) = status {
        let delivered = err_txs
            .iter()
            .filter(|tx| tx.try_send(err.clone()).is_ok())
            .count();
        if delivered == 0 {
            tracing::error!(stage = %name, error = %err, "no upstream left to report the error to");
        }
    }
}

async fn drive<IN, OUT>(
    name: &str,
    processor: &mut dyn Processor<IN, OUT>,
    reader: &mut Reader<IN>,
    emitter: &mut Emitter<OUT>,
    outputs: &mut Outputs<OUT>,
    next: &mut NextErrors,
    stall: Option<&StallRole>,
) -> Exit
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    loop {
        if let Some(role) = stall {
            role.before_data(name);
        }

        let input = tokio::select! {
            biased;
            event = next.event() => {
                return Exit::Downstream {
                    err: event,
                    pending: Vec::new(),
                };
            }
            input = reader.recv() => input,
        };

        let flow = match input {
            Some(input) => {
                let _working = match stall {
                    Some(role) => role.enter().await,
                    None => None,
                };
                processor.process(input, outputs).await
            }
            None => Ok(Flow::NoMoreData),
        };
        let flow = match flow {
            Ok(flow) => flow,
            Err(e) => return Exit::Failed(PipelineError::process(name, e)),
        };
        if let Err(exit) = emitter.emit(outputs, next).await {
            return exit;
        }

        if flow == Flow::NoMoreData {
            if let Err(e) = processor.on_no_more_data(outputs).await {
                return Exit::Failed(PipelineError::process(name, e));
            }
            return match emitter.emit(outputs, next).await {
                Ok(()) => Exit::Finished,
                Err(exit) => exit,
            };
        }
    }
}

enum Reader<IN> {
    Generator(fn() -> IN),
    Sequential {
        rxs: Vec<mpsc::Receiver<IN>>,
        next: usize,
    },
    Concurrent {
        rx: mpsc::Receiver<IN>,
        _readers: JoinSet<()>,
    },
}

impl<IN: Send + 'static> Reader<IN> {
    fn start(input: RunInput<IN>, policy: InputPolicy) -> Self {
        let rxs = match input {
            RunInput::Generator(generator) => return Reader::Generator(generator),
            RunInput::Channels(rxs) => rxs,
        };
        match policy {
            InputPolicy::Sequential => Reader::Sequential { rxs, next: 0 },
            InputPolicy::Concurrent => {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                let mut readers = JoinSet::new();
                for mut incoming in rxs {
                    let tx = tx.clone();
                    readers.spawn(async move {
                        loop {
                            tokio::select! {
                                _ = tx.closed() => break,
                                item = incoming.recv() => match item {
                                    Some(item) => {
                                        if tx.send(item).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                            }
                        }
                    });
                }
                Reader::Concurrent {
                    rx,
                    _readers: readers,
                }
            }
        }
    }

    /// Next input, or `None` once every input channel is closed and drained.
    async fn recv(&mut self) -> Option<IN> {
        match self {
            Reader::Generator(generator) => Some(generator()),
            Reader::Sequential { rxs, next } => loop {
                if rxs.is_empty() {
                    return None;
                }
                let i = *next % rxs.len();
                match rxs[i].recv().await {
                    Some(item) => {
                        *next = (i + 1) % rxs.len();
                        return Some(item);
                    }
                    None => {
                        rxs.remove(i);
                        *next = i;
                    }
                }
            },
            Reader::Concurrent { rx, .. } => rx.recv().await,
        }
    }
}

struct Emitter<OUT> {
    name: String,
    txs: Vec<mpsc::Sender<OUT>>,
    policy: OutputPolicy,
    pending: Vec<Option<(OUT, usize)>>,
    blocked: Vec<bool>,
}

impl<OUT: Send + 'static> Emitter<OUT> {
    fn new(name: &str, txs: Vec<mpsc::Sender<OUT>>, policy: OutputPolicy) -> Self {
        let blocked = vec![false; txs.len()];
        Self {
            name: name.to_string(),
            txs,
            policy,
            pending: Vec::new(),
            blocked,
        }
    }

    fn out_of_range(&self, dest: usize) -> Exit {
        Exit::Failed(PipelineError::lifecycle(
            &self.name,
            format!("output index {dest} out of range ({} outputs)", self.txs.len()),
        ))
    }

    /// Deliver everything in `outputs`, leaving it empty.
    async fn emit(
        &mut self,
        outputs: &mut Outputs<OUT>,
        next: &mut NextErrors,
    ) -> Result<(), Exit> {
        if outputs.is_empty() {
            return Ok(());
        }
        match self.policy {
            OutputPolicy::Sequential => self.emit_sequential(outputs, next).await,
            OutputPolicy::SequentialCyclesAllowed => self.emit_cycles_allowed(outputs, next).await,
            OutputPolicy::Concurrent => self.emit_concurrent(outputs, next).await,
        }
    }

    async fn emit_sequential(
        &mut self,
        outputs: &mut Outputs<OUT>,
        next: &mut NextErrors,
    ) -> Result<(), Exit> {
        let mut items = outputs.take_all();
        while let Some((value, dest)) = items.next() {
            let Some(tx) = self.txs.get(dest) else {
                return Err(self.out_of_range(dest));
            };
            tokio::select! {
                biased;
                event = next.event() => {
                    let rest = items.by_ref().map(|(_, dest)| dest);
                    return Err(Exit::Downstream {
                        err: event,
                        pending: undelivered(std::iter::once(dest).chain(rest)),
                    });
                }
                sent = tx.send(value) => {
                    if sent.is_err() {
                        return Err(Exit::SendFailed(vec![dest]));
                    }
                    tracing::trace!(stage = %self.name, dest, "sent");
                }
            }
        }
        Ok(())
    }

    /// Round-based delivery that never parks on a single destination. Items for a
    /// destination that is full wait for the next round, and so do all later items
    /// for that same destination, which keeps per-channel order.
    async fn emit_cycles_allowed(
        &mut self,
        outputs: &mut Outputs<OUT>,
        next: &mut NextErrors,
    ) -> Result<(), Exit> {
        self.pending.clear();
        self.pending.extend(outputs.take_all().map(Some));
        if let Some(dest) = self
            .pending
            .iter()
            .flatten()
            .map(|(_, dest)| *dest)
            .find(|dest| *dest >= self.txs.len())
        {
            self.pending.clear();
            return Err(self.out_of_range(dest));
        }

        let mut failed = Vec::new();
        loop {
            self.blocked.fill(false);
            for slot in self.pending.iter_mut() {
                let dest = match slot {
                    Some((_, dest)) => *dest,
                    None => continue,
                };
                if self.blocked[dest] {
                    continue;
                }
                if let Some((value, dest)) = slot.take() {
                    match self.txs[dest].try_send(value) {
                        Ok(()) => {}
                        Err(TrySendError::Full(value)) => {
                            *slot = Some((value, dest));
                            self.blocked[dest] = true;
                        }
                        Err(TrySendError::Closed(_)) => {
                            if !failed.contains(&dest) {
                                failed.push(dest);
                            }
                        }
                    }
                }
            }
            self.pending.retain(Option::is_some);

            if !failed.is_empty() {
                self.pending.clear();
                return Err(Exit::SendFailed(failed));
            }
            if self.pending.is_empty() {
                return Ok(());
            }

            tokio::select! {
                biased;
                event = next.event() => {
                    let pending = undelivered(self.pending.iter().flatten().map(|(_, dest)| *dest));
                    self.pending.clear();
                    return Err(Exit::Downstream { err: event, pending });
                }
                _ = tokio::task::yield_now() => {}
            }
        }
    }

    async fn emit_concurrent(
        &mut self,
        outputs: &mut Outputs<OUT>,
        next: &mut NextErrors,
    ) -> Result<(), Exit> {
        let mut sends = JoinSet::new();
        let mut in_flight = vec![0usize; self.txs.len()];
        for (value, dest) in outputs.take_all() {
            let Some(tx) = self.txs.get(dest) else {
                return Err(self.out_of_range(dest));
            };
            let tx = tx.clone();
            in_flight[dest] += 1;
            sends.spawn(async move { (dest, tx.send(value).await.is_ok()) });
        }

        let mut failed = Vec::new();
        loop {
            tokio::select! {
                biased;
                event = next.event() => {
                    let pending = (0..in_flight.len())
                        .filter(|&dest| in_flight[dest] > 0)
                        .collect();
                    return Err(Exit::Downstream { err: event, pending });
                }
                joined = sends.join_next() => match joined {
                    None => break,
                    Some(Ok((dest, sent))) => {
                        in_flight[dest] -= 1;
                        if !sent {
                            failed.push(dest);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(Exit::Failed(PipelineError::lifecycle(
                            &self.name,
                            format!("send task failed: {e}"),
                        )));
                    }
                },
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort_unstable();
            failed.dedup();
            Err(Exit::SendFailed(failed))
        }
    }
}

/// Sorted, distinct output indices.
fn undelivered(dests: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut dests: Vec<usize> = dests.into_iter().collect();
    dests.sort_unstable();
    dests.dedup();
    dests
}

/// Statuses of the downstream stages, merged without extra tasks.
struct NextErrors {
    rxs: Vec<mpsc::Receiver<PipelineError>>,
}

impl NextErrors {
    fn new(rxs: Vec<mpsc::Receiver<PipelineError>>) -> Self {
        Self { rxs }
    }

    /// The next downstream error, or `None` once every link is closed. Never
    /// resolves for a stage without downstream links.
    async fn event(&mut self) -> Option<PipelineError> {
        if self.rxs.is_empty() {
            return std::future::pending().await;
        }
        poll_fn(|cx| self.poll_event(cx)).await
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<PipelineError>> {
        let mut i = 0;
        while i < self.rxs.len() {
            match self.rxs[i].poll_recv(cx) {
                Poll::Ready(Some(err)) => return Poll::Ready(Some(err)),
                Poll::Ready(None) => {
                    self.rxs.swap_remove(i);
                }
                Poll::Pending => i += 1,
            }
        }
        if self.rxs.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    /// Wait until every downstream link is closed, combining what they report.
    async fn drain(&mut self) -> Option<PipelineError> {
        let mut errors = Vec::new();
        while !self.rxs.is_empty() {
            match poll_fn(|cx| self.poll_event(cx)).await {
                Some(err) => errors.push(Some(err)),
                None => break,
            }
        }
        PipelineError::coalesce(errors)
    }

    /// Take the statuses already delivered and stop listening.
    fn drain_ready(&mut self) -> Option<PipelineError> {
        let errors: Vec<_> = self.rxs.iter_mut().map(|rx| rx.try_recv().ok()).collect();
        self.rxs.clear();
        PipelineError::coalesce(errors)
    }
}
