//! # Certificate Worker
//!
//! Batches certificates, writes each batch once deduplicated by ID, and emits a
//! dirty domain per (certificate, name) pair towards the domain workers.

use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::dedup::dedup_columns;
use super::manager::WorkerContext;
use super::shard::Shard;
use super::stats;
use super::types::{Certificate, DirtyDomain, IdHash};
use crate::pipeline::{Flow, OutputPolicy, Outputs, Processor, Stage};

pub struct CertWorker {
    ctx: WorkerContext,
    domain_shard: Shard,
    batch: Vec<Certificate>,
    seen: HashSet<IdHash>,

    ids: Vec<IdHash>,
    parent_ids: Vec<Option<IdHash>>,
    expirations: Vec<DateTime<Utc>>,
    payloads: Vec<Vec<u8>>,
}

impl CertWorker {
    /// A worker routing its dirty domains over `domain_workers` outputs.
    pub fn new(ctx: WorkerContext, domain_workers: usize) -> Self {
        let size = ctx.multi_insert_size;
        Self {
            ctx,
            domain_shard: Shard::new(domain_workers),
            batch: Vec::with_capacity(size),
            seen: HashSet::with_capacity(size),
            ids: Vec::with_capacity(size),
            parent_ids: Vec::with_capacity(size),
            expirations: Vec::with_capacity(size),
            payloads: Vec::with_capacity(size),
        }
    }

    /// Stage `cert-worker-{index}` with one output per domain worker.
    pub fn into_stage(self, index: usize) -> Stage<Certificate, DirtyDomain> {
        let outputs = self.domain_shard.workers();
        Stage::new(format!("cert-worker-{index}"), self)
            .with_multi_outputs(outputs)
            .with_output_policy(OutputPolicy::Sequential)
    }

    async fn flush(&mut self, out: &mut Outputs<DirtyDomain>) -> anyhow::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        dedup_columns(&mut self.batch, &mut self.seen, |batch, row| batch[row].cert_id);

        self.ids.clear();
        self.parent_ids.clear();
        self.expirations.clear();
        self.payloads.clear();
        let mut bytes = 0;
        for cert in &mut self.batch {
            bytes += cert.payload.len();
            self.ids.push(cert.cert_id);
            self.parent_ids.push(cert.parent_id);
            self.expirations.push(cert.expiration);
            self.payloads.push(std::mem::take(&mut cert.payload));
        }

        self.ctx
            .conn
            .update_certs(&self.ids, &self.parent_ids, &self.expirations, &self.payloads)
            .await
            .with_context(|| format!("writing {} certificates", self.ids.len()))?;
        tracing::debug!(rows = self.ids.len(), bytes, "certificates written");

        stats::add(&self.ctx.stats.written_certs, self.ids.len());
        stats::add(&self.ctx.stats.written_bytes, bytes);
        self.ctx.cache.add_ids(&self.ids);

        for cert in self.batch.drain(..) {
            for name in cert.names.into_iter().flatten() {
                let dirty = DirtyDomain::new(cert.cert_id, name);
                let dest = self.domain_shard.index(&dirty.domain_id);
                out.push(dirty, dest);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Processor<Certificate, DirtyDomain> for CertWorker {
    async fn process(
        &mut self,
        cert: Certificate,
        out: &mut Outputs<DirtyDomain>,
    ) -> anyhow::Result<Flow> {
        self.batch.push(cert);
        if self.batch.len() >= self.ctx.multi_insert_size {
            self.flush(out).await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_no_more_data(&mut self, out: &mut Outputs<DirtyDomain>) -> anyhow::Result<()> {
        self.flush(out).await
    }

    fn on_resume(&mut self) {
        // A stopped run may have left a partial batch behind.
        self.batch.clear();
    }
}
