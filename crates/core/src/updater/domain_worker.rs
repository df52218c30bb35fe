//! # Domain Worker
//!
//! Collects dirty domains from every certificate worker and writes each batch in
//! three passes, one per table, each deduplicated by that table's key.

use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;

use super::dedup::dedup_columns;
use super::manager::WorkerContext;
use super::stats;
use super::types::{DirtyDomain, IdHash};
use crate::pipeline::{Flow, Outputs, Processor, Sink};

pub struct DomainWorker {
    ctx: WorkerContext,

    domain_ids: Vec<IdHash>,
    cert_ids: Vec<IdHash>,
    names: Vec<String>,

    // Per-pass copies; the batch columns stay intact for the next pass.
    dirty_ids: Vec<IdHash>,
    name_rows: (Vec<IdHash>, Vec<String>),
    cert_rows: (Vec<IdHash>, Vec<IdHash>),

    seen_ids: HashSet<IdHash>,
    seen_names: HashSet<(IdHash, String)>,
    seen_certs: HashSet<(IdHash, IdHash)>,
}

impl DomainWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let size = ctx.multi_insert_size;
        Self {
            ctx,
            domain_ids: Vec::with_capacity(size),
            cert_ids: Vec::with_capacity(size),
            names: Vec::with_capacity(size),
            dirty_ids: Vec::with_capacity(size),
            name_rows: (Vec::with_capacity(size), Vec::with_capacity(size)),
            cert_rows: (Vec::with_capacity(size), Vec::with_capacity(size)),
            seen_ids: HashSet::with_capacity(size),
            seen_names: HashSet::with_capacity(size),
            seen_certs: HashSet::with_capacity(size),
        }
    }

    /// Sink `domain-worker-{index}` reading one input per certificate worker.
    pub fn into_sink(self, index: usize, cert_workers: usize) -> Sink<DirtyDomain> {
        Sink::new(format!("domain-worker-{index}"), self)
            .with_multi_inputs(cert_workers)
            .with_concurrent_inputs()
    }

    fn len(&self) -> usize {
        self.domain_ids.len()
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.domain_ids.is_empty() {
            return Ok(());
        }
        let conn = &self.ctx.conn;

        self.dirty_ids.clear();
        self.dirty_ids.extend_from_slice(&self.domain_ids);
        dedup_columns(&mut self.dirty_ids, &mut self.seen_ids, |ids, row| ids[row]);
        conn.insert_domains_into_dirty(&self.dirty_ids)
            .await
            .context("marking domains dirty")?;

        self.name_rows.0.clear();
        self.name_rows.1.clear();
        self.name_rows.0.extend_from_slice(&self.domain_ids);
        self.name_rows.1.extend_from_slice(&self.names);
        dedup_columns(&mut self.name_rows, &mut self.seen_names, |rows, row| {
            (rows.0[row], rows.1[row].clone())
        });
        conn.update_domains(&self.name_rows.0, &self.name_rows.1)
            .await
            .context("writing domain names")?;

        self.cert_rows.0.clear();
        self.cert_rows.1.clear();
        self.cert_rows.0.extend_from_slice(&self.domain_ids);
        self.cert_rows.1.extend_from_slice(&self.cert_ids);
        dedup_columns(&mut self.cert_rows, &mut self.seen_certs, |rows, row| {
            (rows.0[row], rows.1[row])
        });
        conn.update_domain_certs(&self.cert_rows.0, &self.cert_rows.1)
            .await
            .context("writing domain certificates")?;

        tracing::debug!(
            rows = self.len(),
            domains = self.dirty_ids.len(),
            pairs = self.cert_rows.0.len(),
            "domains written"
        );
        stats::add(&self.ctx.stats.written_domains, self.name_rows.0.len());

        self.domain_ids.clear();
        self.cert_ids.clear();
        self.names.clear();
        Ok(())
    }
}

#[async_trait]
impl Processor<DirtyDomain, ()> for DomainWorker {
    async fn process(
        &mut self,
        domain: DirtyDomain,
        _out: &mut Outputs<()>,
    ) -> anyhow::Result<Flow> {
        self.domain_ids.push(domain.domain_id);
        self.cert_ids.push(domain.cert_id);
        self.names.push(domain.name);
        if self.len() >= self.ctx.multi_insert_size {
            self.flush().await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_no_more_data(&mut self, _out: &mut Outputs<()>) -> anyhow::Result<()> {
        self.flush().await
    }

    fn on_resume(&mut self) {
        self.domain_ids.clear();
        self.cert_ids.clear();
        self.names.clear();
    }
}
