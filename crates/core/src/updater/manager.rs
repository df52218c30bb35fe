//! # Update Manager
//!
//! Builds and drives the ingestion pipeline:
//!
//! ```text
//!                 ┌→ cert-worker-0 ─┬→ domain-worker-0
//! incoming → src ─┤                 ╳
//!                 └→ cert-worker-1 ─┴→ domain-worker-1
//! ```
//!
//! Every certificate worker has one output per domain worker, and every domain
//! worker one input per certificate worker. Certificates are routed by the top
//! bits of their ID, dirty domains by the top bits of the domain ID, so a given
//! row is always written by the same worker.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use super::cert_worker::CertWorker;
use super::domain_worker::DomainWorker;
use super::shard::Shard;
use super::stats::{self, Stats, StatsFn};
use super::types::{Certificate, DirtyDomain};
use crate::cache::{NoCache, PresenceCache, SetCache};
use crate::config::IngestConfig;
use crate::db::Conn;
use crate::pipeline::{
    link_stages_at, OutputPolicy, Pipeline, PipelineError, Sink, Source, Stage, CHANNEL_CAPACITY,
};

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("the manager is not accepting certificates")]
    IncomingClosed,
}

/// What every worker shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub conn: Arc<dyn Conn>,
    pub stats: Arc<Stats>,
    pub cache: Arc<dyn PresenceCache>,
    pub multi_insert_size: usize,
}

#[cfg(test)]
impl WorkerContext {
    pub(crate) fn for_tests(conn: Arc<crate::db::MemoryConn>, multi_insert_size: usize) -> Self {
        Self {
            conn,
            stats: Stats::new(Duration::ZERO, None),
            cache: Arc::new(NoCache),
            multi_insert_size,
        }
    }
}

pub struct Manager {
    pipeline: Pipeline,
    source: Source<Certificate>,
    shard: Shard,
    stats: Arc<Stats>,
    incoming: Option<mpsc::Sender<Certificate>>,
}

impl Manager {
    /// A manager with `worker_count` certificate workers and as many domain
    /// workers, writing in batches of `multi_insert_size`.
    pub fn new(
        worker_count: usize,
        conn: Arc<dyn Conn>,
        multi_insert_size: usize,
        stats_update_freq: Duration,
        stats_fn: Option<StatsFn>,
    ) -> Result<Self, UpdaterError> {
        Self::with_cache(
            worker_count,
            conn,
            Arc::new(NoCache),
            multi_insert_size,
            stats_update_freq,
            stats_fn,
        )
    }

    pub fn from_config(
        config: &IngestConfig,
        conn: Arc<dyn Conn>,
        stats_fn: Option<StatsFn>,
    ) -> Result<Self, UpdaterError> {
        config
            .validate()
            .map_err(|e| UpdaterError::InvalidConfig(e.to_string()))?;
        let cache: Arc<dyn PresenceCache> = if config.presence_cache {
            Arc::new(SetCache::with_capacity(config.multi_insert_size * config.worker_count))
        } else {
            Arc::new(NoCache)
        };
        Self::with_cache(
            config.worker_count,
            conn,
            cache,
            config.multi_insert_size,
            config.stats_update_freq(),
            stats_fn,
        )
    }

    /// Like [`Manager::new`], skipping certificates `cache` reports as present.
    /// Written certificates are added to the cache.
    pub fn with_cache(
        worker_count: usize,
        conn: Arc<dyn Conn>,
        cache: Arc<dyn PresenceCache>,
        multi_insert_size: usize,
        stats_update_freq: Duration,
        stats_fn: Option<StatsFn>,
    ) -> Result<Self, UpdaterError> {
        if worker_count == 0 {
            return Err(UpdaterError::InvalidConfig("worker count must be positive".into()));
        }
        if multi_insert_size == 0 {
            return Err(UpdaterError::InvalidConfig("multi insert size must be positive".into()));
        }

        let stats = Stats::new(stats_update_freq, stats_fn);
        let shard = Shard::new(worker_count);
        let ctx = WorkerContext {
            conn,
            stats: Arc::clone(&stats),
            cache,
            multi_insert_size,
        };

        // Closed until the first resume installs a live feed.
        let (_, idle) = mpsc::channel(CHANNEL_CAPACITY);
        let source = Source::from_channel_filtered("manager-source", idle, {
            let stats = Arc::clone(&stats);
            let cache = Arc::clone(&ctx.cache);
            move |cert: &Certificate| -> anyhow::Result<Option<usize>> {
                stats::add(&stats.read_certs, 1);
                stats::add(&stats.read_bytes, cert.payload.len());
                if cache.contains(&cert.cert_id) {
                    return Ok(None);
                }
                stats::add(&stats.uncached_certs, 1);
                Ok(Some(shard.index(&cert.cert_id)))
            }
        })
        .with_multi_outputs(worker_count)
        .with_output_policy(OutputPolicy::Sequential);

        let cert_workers: Vec<Stage<Certificate, DirtyDomain>> = (0..worker_count)
            .map(|i| CertWorker::new(ctx.clone(), worker_count).into_stage(i))
            .collect();
        let domain_workers: Vec<Sink<DirtyDomain>> = (0..worker_count)
            .map(|i| DomainWorker::new(ctx.clone()).into_sink(i, worker_count))
            .collect();

        let mut stages = vec![source.handle()];
        stages.extend(cert_workers.iter().map(Stage::handle));
        stages.extend(domain_workers.iter().map(Sink::handle));

        let link = {
            let source = source.clone();
            move || {
                for (i, cert_worker) in cert_workers.iter().enumerate() {
                    link_stages_at(source.stage(), i, cert_worker, 0)?;
                    for (j, domain_worker) in domain_workers.iter().enumerate() {
                        link_stages_at(cert_worker, j, domain_worker.stage(), i)?;
                    }
                }
                Ok(())
            }
        };

        tracing::debug!(workers = worker_count, multi_insert_size, "manager created");
        Ok(Self {
            pipeline: Pipeline::new(link, stages),
            source,
            shard,
            stats,
            incoming: None,
        })
    }

    /// Start a run with a fresh incoming channel.
    pub fn resume(&mut self) -> Result<(), UpdaterError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.source.set_feed(rx)?;
        self.pipeline.resume()?;
        self.incoming = Some(tx);
        self.stats.start();
        tracing::info!(workers = self.shard.workers(), "manager running");
        Ok(())
    }

    /// A sender into the running pipeline. The run only ends once every clone is
    /// dropped and [`Manager::close_incoming`] was called.
    pub fn sender(&self) -> Option<mpsc::Sender<Certificate>> {
        self.incoming.clone()
    }

    /// Send one certificate, waiting while the workers are busy.
    pub async fn send(&self, cert: Certificate) -> Result<(), UpdaterError> {
        let tx = self.incoming.as_ref().ok_or(UpdaterError::IncomingClosed)?;
        tx.send(cert).await.map_err(|_| UpdaterError::IncomingClosed)
    }

    /// Send every certificate, then close the incoming channel.
    pub async fn process_certificates<I>(&mut self, certs: I) -> Result<(), UpdaterError>
    where
        I: IntoIterator<Item = Certificate>,
    {
        let result = async {
            for cert in certs {
                self.send(cert).await?;
            }
            Ok::<(), UpdaterError>(())
        }
        .await;
        self.close_incoming();
        result
    }

    /// Graceful end of input: every batch still buffered gets written.
    pub fn close_incoming(&mut self) {
        self.incoming = None;
    }

    /// Wait for the run to finish.
    pub async fn wait(&mut self) -> Result<(), UpdaterError> {
        let result = self.pipeline.wait().await;
        self.finish(result)
    }

    /// Abandon the run. Certificates buffered in workers are not written.
    pub async fn stop(&mut self) -> Result<(), UpdaterError> {
        self.incoming = None;
        let result = self.pipeline.stop_and_wait().await;
        self.finish(result)
    }

    fn finish(&mut self, result: Result<(), PipelineError>) -> Result<(), UpdaterError> {
        self.stats.stop();
        let snap = self.stats.snapshot();
        match &result {
            Ok(()) => tracing::info!(
                read = snap.read_certs,
                written = snap.written_certs,
                domains = snap.written_domains,
                "manager finished"
            ),
            Err(err) => tracing::error!(error = %err, "manager failed"),
        }
        Ok(result?)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Routing of both certificate and domain IDs.
    pub fn shard(&self) -> Shard {
        self.shard
    }

    pub fn worker_count(&self) -> usize {
        self.shard.workers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryConn, Table};
    use crate::updater::IdHash;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn leaf(i: usize) -> Certificate {
        Certificate::new(
            format!("cert-{i}").into_bytes(),
            Utc::now(),
            None,
            Some(vec![format!("domain-{i}.com")]),
        )
    }

    fn manager(conn: &Arc<MemoryConn>, workers: usize, batch: usize) -> Manager {
        let conn: Arc<dyn Conn> = Arc::clone(conn) as Arc<dyn Conn>;
        Manager::new(workers, conn, batch, Duration::ZERO, None).unwrap()
    }

    /// Asserts no ID appears in two calls and returns the union.
    fn disjoint_union<T: Clone + Eq + std::hash::Hash + std::fmt::Debug>(
        calls: Vec<Vec<T>>,
    ) -> HashSet<T> {
        let mut all = HashSet::new();
        for call in calls {
            for row in call {
                assert!(all.insert(row.clone()), "{row:?} written twice");
            }
        }
        all
    }

    #[test]
    fn test_rejects_zero_workers_or_batch() {
        let conn: Arc<dyn Conn> = Arc::new(MemoryConn::new());
        assert!(matches!(
            Manager::new(0, Arc::clone(&conn), 10, Duration::ZERO, None),
            Err(UpdaterError::InvalidConfig(_))
        ));
        assert!(matches!(
            Manager::new(2, conn, 0, Duration::ZERO, None),
            Err(UpdaterError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_every_certificate_written_exactly_once() {
        for (workers, batch) in [(1, 1), (1, 7), (3, 4), (4, 100)] {
            let conn = Arc::new(MemoryConn::new());
            let mut m = manager(&conn, workers, batch);
            let certs: Vec<Certificate> = (0..57).map(leaf).collect();
            let expected: HashSet<IdHash> = certs.iter().map(|c| c.cert_id).collect();

            m.resume().unwrap();
            m.process_certificates(certs).await.unwrap();
            m.wait().await.unwrap();

            assert_eq!(disjoint_union(conn.cert_calls()), expected);
            assert_eq!(m.stats().written_certs.load(Ordering::Relaxed), 57);
            assert_eq!(m.stats().read_certs.load(Ordering::Relaxed), 57);
        }
    }

    #[tokio::test]
    async fn test_two_workers_batch_ten_twenty_five_certs() {
        let conn = Arc::new(MemoryConn::new());
        let mut m = manager(&conn, 2, 10);

        m.resume().unwrap();
        m.process_certificates((0..25).map(leaf)).await.unwrap();
        m.wait().await.unwrap();

        assert_eq!(disjoint_union(conn.cert_calls()).len(), 25);
        let pairs = disjoint_union(conn.domain_calls());
        assert_eq!(pairs.len(), 25);
        for (domain_id, name) in &pairs {
            assert_eq!(*domain_id, IdHash::of_name(name));
        }
        assert_eq!(conn.dirty().len(), 25);
        assert_eq!(conn.domain_certs().len(), 25);
        assert_eq!(m.stats().written_domains.load(Ordering::Relaxed), 25);
    }

    #[tokio::test]
    async fn test_duplicate_in_batch_written_once() {
        let conn = Arc::new(MemoryConn::new());
        let mut m = manager(&conn, 1, 10);

        m.resume().unwrap();
        m.process_certificates([leaf(1), leaf(1)]).await.unwrap();
        m.wait().await.unwrap();

        let calls = conn.cert_calls();
        assert_eq!(calls, vec![vec![leaf(1).cert_id]]);
    }

    #[tokio::test]
    async fn test_leaf_names_become_dirty_domains() {
        let conn = Arc::new(MemoryConn::new());
        let mut m = manager(&conn, 4, 10);
        let cert = Certificate::new(
            b"leaf".to_vec(),
            Utc::now(),
            None,
            Some(vec!["a".to_string(), "b".to_string()]),
        );
        let id = cert.cert_id;

        m.resume().unwrap();
        m.process_certificates([cert]).await.unwrap();
        m.wait().await.unwrap();

        let expected: HashSet<(IdHash, IdHash)> = [
            (IdHash::of_name("a"), id),
            (IdHash::of_name("b"), id),
        ]
        .into_iter()
        .collect();
        assert_eq!(conn.domain_certs().into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_chain_unfolds_into_parent_links() {
        use crate::updater::{CertWithChain, ChainCert};

        let conn = Arc::new(MemoryConn::new());
        let mut m = manager(&conn, 2, 3);
        let root = ChainCert {
            payload: b"root".to_vec(),
            expiration: Utc::now(),
        };
        let chain = CertWithChain {
            cert_id: IdHash::of(b"leaf"),
            payload: b"leaf".to_vec(),
            expiration: Utc::now(),
            names: vec!["example.com".to_string()],
            chain_ids: vec![IdHash::of(b"root")],
            chain: vec![Some(root)],
        };

        m.resume().unwrap();
        m.process_certificates(chain.unfold()).await.unwrap();
        m.wait().await.unwrap();

        let leaf = conn.cert(&IdHash::of(b"leaf")).unwrap();
        assert_eq!(leaf.parent_id, Some(IdHash::of(b"root")));
        assert_eq!(conn.cert(&IdHash::of(b"root")).unwrap().parent_id, None);
        assert_eq!(conn.domains().len(), 1);
    }

    #[tokio::test]
    async fn test_cached_certificates_are_skipped() {
        let conn = Arc::new(MemoryConn::new());
        let cache = Arc::new(SetCache::new());
        cache.add_ids(&[leaf(0).cert_id]);
        let mut m = Manager::with_cache(
            2,
            Arc::clone(&conn) as Arc<dyn Conn>,
            Arc::clone(&cache) as Arc<dyn PresenceCache>,
            5,
            Duration::ZERO,
            None,
        )
        .unwrap();

        m.resume().unwrap();
        m.process_certificates((0..10).map(leaf)).await.unwrap();
        m.wait().await.unwrap();

        assert_eq!(disjoint_union(conn.cert_calls()).len(), 9);
        assert_eq!(m.stats().read_certs.load(Ordering::Relaxed), 10);
        assert_eq!(m.stats().uncached_certs.load(Ordering::Relaxed), 9);
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test]
    async fn test_db_failure_reported_by_wait() {
        let conn = Arc::new(MemoryConn::new());
        conn.fail_on(Table::Domains);
        let mut m = manager(&conn, 2, 1);

        m.resume().unwrap();
        // Sending may fail once the pipeline has torn down.
        let _ = m.process_certificates((0..20).map(leaf)).await;
        let err = m.wait().await.unwrap_err();

        let UpdaterError::Pipeline(err) = err else {
            panic!("unexpected error {err}");
        };
        let failed = err.failed_stages();
        assert!(!failed.is_empty());
        assert!(failed.iter().all(|s| s.starts_with("domain-worker-")));
    }

    #[tokio::test]
    async fn test_manager_runs_again_after_wait() {
        let conn = Arc::new(MemoryConn::new());
        let mut m = manager(&conn, 2, 4);

        m.resume().unwrap();
        m.process_certificates((0..5).map(leaf)).await.unwrap();
        m.wait().await.unwrap();

        m.resume().unwrap();
        m.process_certificates((5..12).map(leaf)).await.unwrap();
        m.wait().await.unwrap();

        assert_eq!(disjoint_union(conn.cert_calls()).len(), 12);
    }

    #[tokio::test]
    async fn test_stop_closes_incoming() {
        let conn = Arc::new(MemoryConn::new());
        let mut m = manager(&conn, 2, 1000);

        m.resume().unwrap();
        let sender = m.sender().unwrap();
        for i in 0..3 {
            sender.send(leaf(i)).await.unwrap();
        }
        m.stop().await.unwrap();

        // Batches were never full: nothing is written, and the feed is gone.
        assert!(conn.cert_calls().is_empty());
        assert!(sender.send(leaf(3)).await.is_err());
        assert!(matches!(m.send(leaf(4)).await, Err(UpdaterError::IncomingClosed)));
    }

    #[tokio::test]
    async fn test_send_before_resume_fails() {
        let conn = Arc::new(MemoryConn::new());
        let m = manager(&conn, 1, 1);
        assert!(matches!(m.send(leaf(0)).await, Err(UpdaterError::IncomingClosed)));
    }
}
