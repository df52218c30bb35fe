//! # Stalling
//!
//! Pauses a set of stages at a point where none of them is inside its processing
//! function, runs a callback, and lets them continue.
//!
//! Stalling stages hold a shared read guard while processing. When an evaluating
//! stage decides to stall, a releaser task queues for the write guard; tokio's
//! `RwLock` is fair, so new processing calls wait behind it while the ones in
//! flight finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, RwLock};

pub(crate) type WhenStalled = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ShouldStall = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) struct StallGate {
    lock: Arc<RwLock<()>>,
    when_stalled: WhenStalled,
    should_stall: ShouldStall,
    releasing: AtomicBool,
}

impl StallGate {
    pub(crate) fn new(when_stalled: WhenStalled, should_stall: ShouldStall) -> Arc<Self> {
        Arc::new(Self {
            lock: Arc::new(RwLock::new(())),
            when_stalled,
            should_stall,
            releasing: AtomicBool::new(false),
        })
    }
}

/// Part a stage plays in a stall group.
#[derive(Clone)]
pub struct StallRole {
    gate: Arc<StallGate>,
    holds: bool,
    evaluates: bool,
}

impl StallRole {
    pub(crate) fn new(gate: Arc<StallGate>, holds: bool, evaluates: bool) -> Self {
        Self {
            gate,
            holds,
            evaluates,
        }
    }

    /// Evaluate the stall predicate before reading the next input. At most one
    /// releaser runs at a time.
    pub(crate) fn before_data(&self, stage: &str) {
        if !self.evaluates || !(self.gate.should_stall)(stage) {
            return;
        }
        if self.gate.releasing.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(stage = %stage, "stalling pipeline");
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            let _exclusive = gate.lock.write().await;
            tracing::debug!("stall stages are idle");
            (gate.when_stalled)();
            gate.releasing.store(false, Ordering::SeqCst);
        });
    }

    /// Enter the processing function. Waits while a stall is being released.
    pub(crate) async fn enter(&self) -> Option<OwnedRwLockReadGuard<()>> {
        if !self.holds {
            return None;
        }
        Some(Arc::clone(&self.gate.lock).read_owned().await)
    }
}
