//! # Update Statistics
//!
//! Atomic counters shared by the manager's stages, reported to a callback on a
//! fixed interval.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type StatsFn = Arc<dyn Fn(&Stats) + Send + Sync>;

pub struct Stats {
    pub create_time: DateTime<Utc>,
    last_start_time: Mutex<DateTime<Utc>>,

    pub read_certs: AtomicI64,
    pub read_bytes: AtomicI64,
    pub uncached_certs: AtomicI64,
    pub written_certs: AtomicI64,
    pub written_bytes: AtomicI64,
    pub written_domains: AtomicI64,

    update_freq: Duration,
    update_fn: StatsFn,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub create_time: DateTime<Utc>,
    pub last_start_time: DateTime<Utc>,
    pub read_certs: i64,
    pub read_bytes: i64,
    pub uncached_certs: i64,
    pub written_certs: i64,
    pub written_bytes: i64,
    pub written_domains: i64,
}

impl Stats {
    /// Counters reported to `update_fn` every `update_freq` while started. A zero
    /// frequency disables the reports.
    pub fn new(update_freq: Duration, update_fn: Option<StatsFn>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            create_time: now,
            last_start_time: Mutex::new(now),
            read_certs: AtomicI64::new(0),
            read_bytes: AtomicI64::new(0),
            uncached_certs: AtomicI64::new(0),
            written_certs: AtomicI64::new(0),
            written_bytes: AtomicI64::new(0),
            written_domains: AtomicI64::new(0),
            update_freq,
            update_fn: update_fn.unwrap_or_else(|| Arc::new(|_: &Stats| {})),
            ticker: Mutex::new(None),
        })
    }

    /// Start (or restart) the periodic reports. Needs a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        *self
            .last_start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();

        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = ticker.take() {
            previous.abort();
        }
        if self.update_freq.is_zero() {
            return;
        }

        // The ticker must not keep the counters alive, or Drop would never stop it.
        let stats: Weak<Self> = Arc::downgrade(self);
        let mut interval = tokio::time::interval(self.update_freq);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        *ticker = Some(tokio::spawn(async move {
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(stats) = stats.upgrade() else {
                    break;
                };
                (stats.update_fn)(&stats);
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
    }

    pub fn last_start_time(&self) -> DateTime<Utc> {
        *self
            .last_start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            create_time: self.create_time,
            last_start_time: self.last_start_time(),
            read_certs: self.read_certs.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            uncached_certs: self.uncached_certs.load(Ordering::Relaxed),
            written_certs: self.written_certs.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            written_domains: self.written_domains.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn add(counter: &AtomicI64, amount: usize) {
    counter.fetch_add(i64::try_from(amount).unwrap_or(i64::MAX), Ordering::Relaxed);
}

impl Drop for Stats {
    fn drop(&mut self) {
        self.stop();
    }
}
